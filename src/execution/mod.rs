// Order submission, venue callbacks and lifecycle tracking
pub mod adapter;
pub mod gateway;
pub mod monitor;
pub mod paper;

pub use gateway::{ExecutionGateway, FillReport, OrderReport, VenueCallbacks};
pub use monitor::{ErrorRecord, EventKind, MonitorStats, OrderEvent, OrderMonitor};
pub use paper::PaperGateway;
