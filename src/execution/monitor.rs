use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use super::gateway::{FillReport, OrderReport, VenueCallbacks};
use crate::models::{Fill, Order, OrderStatus, Side};

/// Observer categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Confirmed,
    Traded,
    Completed,
    Error,
}

/// Payload handed to observers (always a copy, never a live reference)
#[derive(Debug, Clone)]
pub enum OrderEvent {
    Confirmed(Order),
    Traded(Fill),
    Completed(Order),
    Error(ErrorRecord),
}

impl OrderEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OrderEvent::Confirmed(_) => EventKind::Confirmed,
            OrderEvent::Traded(_) => EventKind::Traded,
            OrderEvent::Completed(_) => EventKind::Completed,
            OrderEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    /// Orders passed to `register`
    pub total_submitted: u64,
    /// Orders acknowledged by the venue at least once
    pub confirmed: u64,
    /// Orders archived in a terminal status
    pub completed: u64,
    /// Venue error callbacks
    pub failed: u64,
    /// Reports refused because they contradicted what was already known
    pub anomalies: u64,
    pub total_traded_amount: f64,
}

pub type Handler = Arc<dyn Fn(&OrderEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    next_key: u64,
    active: BTreeMap<u64, Order>,
    archive: BTreeMap<u64, Order>,
    by_seq: HashMap<u64, u64>,
    by_order_id: HashMap<String, u64>,
    fills: Vec<Fill>,
    errors: Vec<ErrorRecord>,
    stats: MonitorStats,
    /// Events waiting for observer dispatch, in the order the state changed
    outbox: VecDeque<OrderEvent>,
}

impl MonitorState {
    fn insert(&mut self, order: Order) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        if let Some(seq) = order.seq {
            self.by_seq.insert(seq, key);
        }
        if let Some(order_id) = &order.order_id {
            self.by_order_id.insert(order_id.clone(), key);
        }
        self.active.insert(key, order);
        key
    }

    fn get_mut(&mut self, key: u64) -> Option<&mut Order> {
        match self.active.get_mut(&key) {
            Some(order) => Some(order),
            None => self.archive.get_mut(&key),
        }
    }

    fn get(&self, key: u64) -> Option<&Order> {
        self.active.get(&key).or_else(|| self.archive.get(&key))
    }

    /// Fold a registered record that has not been acknowledged yet into the
    /// record the venue knows by order id
    fn absorb(&mut self, keep: u64, other: u64) -> bool {
        match self.active.get(&other) {
            Some(source) if source.order_id.is_none() => {}
            _ => return false,
        }
        let Some(source) = self.active.remove(&other) else {
            return false;
        };
        let seq = source.seq;

        let Some(target) = self.get_mut(keep) else {
            self.active.insert(other, source);
            return false;
        };
        target.seq = seq;
        target.registered |= source.registered;
        target.submitted_at = target.submitted_at.min(source.submitted_at);
        if target.instrument.is_empty() {
            target.instrument = source.instrument;
        }
        if target.side.is_none() {
            target.side = source.side;
        }
        if target.quantity == 0 {
            target.quantity = source.quantity;
        }
        if target.price == 0.0 {
            target.price = source.price;
        }
        if target.remark.is_empty() {
            target.remark = source.remark;
        }

        if let Some(seq) = seq {
            self.by_seq.insert(seq, keep);
        }
        true
    }

    fn archive(&mut self, key: u64) -> Option<Order> {
        let order = self.active.remove(&key)?;
        self.archive.insert(key, order.clone());
        self.stats.completed += 1;
        Some(order)
    }
}

struct Inner {
    state: Mutex<MonitorState>,
    observers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    /// Held by the thread currently draining the outbox
    dispatch: Mutex<()>,
}

/// Single source of truth for in-flight and completed orders
///
/// All order state sits behind one mutex. Observers are never called with
/// that mutex held: state changes queue a copy of the event, and whichever
/// thread wins the dispatch lock drains the queue in order. A handler may
/// call back into the monitor (including the venue callbacks) without
/// deadlocking; nested events are delivered after the current one.
#[derive(Clone)]
pub struct OrderMonitor {
    inner: Arc<Inner>,
}

impl Default for OrderMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MonitorState::default()),
                observers: RwLock::new(HashMap::new()),
                dispatch: Mutex::new(()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        // Observers never run under this lock, so a poisoned guard still holds consistent state
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a freshly submitted order under its local sequence number
    pub fn register(
        &self,
        seq: u64,
        instrument: &str,
        side: Side,
        quantity: u64,
        price: f64,
        remark: &str,
    ) {
        let mut state = self.state();

        if let Some(&key) = state.by_seq.get(&seq) {
            let Some(order) = state.get_mut(key) else {
                return;
            };
            if order.registered {
                tracing::warn!(seq, instrument, "Order already registered, ignoring duplicate");
                return;
            }

            // The venue got here first; complete the record it created
            order.registered = true;
            if order.instrument.is_empty() {
                order.instrument = instrument.to_string();
            }
            order.side.get_or_insert(side);
            if order.quantity == 0 {
                order.quantity = quantity;
            }
            order.price = price;
            if order.remark.is_empty() {
                order.remark = remark.to_string();
            }
            let status = order.status;
            state.stats.total_submitted += 1;

            tracing::info!(
                seq,
                instrument,
                side = %side,
                quantity,
                status = %status,
                "Registered order after venue acknowledgement"
            );
            return;
        }

        let now = Utc::now();
        state.insert(Order {
            seq: Some(seq),
            order_id: None,
            instrument: instrument.to_string(),
            side: Some(side),
            quantity,
            price,
            remark: remark.to_string(),
            submitted_at: now,
            updated_at: now,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            registered: true,
            acknowledged: false,
        });
        state.stats.total_submitted += 1;
        drop(state);

        if price > 0.0 {
            tracing::info!(seq, instrument, side = %side, quantity, price, "📝 Registered order");
        } else {
            tracing::info!(seq, instrument, side = %side, quantity, "📝 Registered order at best price");
        }
    }

    /// Apply a venue acknowledgement (idempotent upsert)
    pub fn on_acknowledged(&self, report: OrderReport) {
        self.apply_acknowledgement(report);
        self.drain();
    }

    fn apply_acknowledgement(&self, report: OrderReport) {
        let mut state = self.state();

        let known = state.by_order_id.get(&report.order_id).copied().or_else(|| {
            report.seq.and_then(|seq| state.by_seq.get(&seq).copied())
        });

        let key = match known {
            Some(key) => key,
            None => {
                let now = Utc::now();
                state.insert(Order {
                    seq: report.seq,
                    order_id: Some(report.order_id.clone()),
                    instrument: report.instrument.clone(),
                    side: report.side,
                    quantity: report.requested_quantity.unwrap_or(0),
                    price: 0.0,
                    remark: report.remark.clone(),
                    submitted_at: now,
                    updated_at: now,
                    status: OrderStatus::Pending,
                    filled_quantity: 0,
                    registered: false,
                    acknowledged: false,
                })
            }
        };

        // An order id never changes instrument or side
        let conflict = match state.get(key) {
            Some(order) => {
                let id_conflict = matches!(&order.order_id, Some(id) if *id != report.order_id);
                let instrument_conflict =
                    !order.instrument.is_empty() && order.instrument != report.instrument;
                let side_conflict = matches!((order.side, report.side), (Some(a), Some(b)) if a != b);
                let seq_conflict = matches!((order.seq, report.seq), (Some(a), Some(b)) if a != b);
                id_conflict || instrument_conflict || side_conflict || seq_conflict
            }
            None => return,
        };
        if conflict {
            state.stats.anomalies += 1;
            tracing::error!(
                order_id = %report.order_id,
                instrument = %report.instrument,
                seq = ?report.seq,
                "Acknowledgement contradicts tracked order, ignoring"
            );
            return;
        }

        if !state.by_order_id.contains_key(&report.order_id) {
            state.by_order_id.insert(report.order_id.clone(), key);
        }

        // A fill may have created the record before the seq was known
        if let Some(seq) = report.seq {
            match state.by_seq.get(&seq).copied() {
                Some(other) if other != key => {
                    if !state.absorb(key, other) {
                        state.stats.anomalies += 1;
                        tracing::error!(
                            order_id = %report.order_id,
                            seq,
                            "Sequence number already belongs to another venue order"
                        );
                        return;
                    }
                }
                Some(_) => {}
                None => {
                    state.by_seq.insert(seq, key);
                    if let Some(order) = state.get_mut(key) {
                        order.seq.get_or_insert(seq);
                    }
                }
            }
        }

        let archived = state.archive.contains_key(&key);
        let Some(order) = state.get_mut(key) else {
            return;
        };

        if archived {
            if order.status == report.status {
                tracing::debug!(order_id = %report.order_id, status = %report.status, "Duplicate terminal acknowledgement");
            } else {
                tracing::warn!(
                    order_id = %report.order_id,
                    current = %order.status,
                    reported = %report.status,
                    "Ignoring status change on completed order"
                );
            }
            return;
        }

        order.order_id.get_or_insert_with(|| report.order_id.clone());
        if order.instrument.is_empty() {
            order.instrument = report.instrument.clone();
        }
        if order.side.is_none() {
            order.side = report.side;
        }
        if order.quantity == 0 {
            order.quantity = report.requested_quantity.unwrap_or(0);
        }
        if order.remark.is_empty() {
            order.remark = report.remark.clone();
        }

        if order.status != report.status {
            if order.status.can_transition_to(report.status) {
                order.status = report.status;
                order.updated_at = Utc::now();
            } else {
                tracing::warn!(
                    order_id = %report.order_id,
                    current = %order.status,
                    reported = %report.status,
                    "Ignoring out-of-order status"
                );
            }
        }

        // First acknowledgement confirms at least REPORTED
        let first_ack = !order.acknowledged;
        if first_ack {
            order.acknowledged = true;
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Reported;
            }
        }

        let snapshot = order.clone();
        let terminal = snapshot.is_terminal();

        tracing::info!(
            order_id = %report.order_id,
            instrument = %snapshot.instrument,
            status = %snapshot.status,
            remark = %report.remark,
            "📋 Order acknowledgement"
        );

        if first_ack {
            state.stats.confirmed += 1;
            state.outbox.push_back(OrderEvent::Confirmed(snapshot));
        }

        if terminal {
            if let Some(completed) = state.archive(key) {
                state.outbox.push_back(OrderEvent::Completed(completed));
            }
        }
    }

    /// Record an execution against a venue order id
    pub fn on_fill(&self, report: FillReport) {
        self.apply_fill(report);
        self.drain();
    }

    fn apply_fill(&self, report: FillReport) {
        let mut state = self.state();

        let key = match state.by_order_id.get(&report.order_id).copied() {
            Some(key) => key,
            None => {
                let now = Utc::now();
                state.insert(Order {
                    seq: None,
                    order_id: Some(report.order_id.clone()),
                    instrument: report.instrument.clone(),
                    side: Some(report.side),
                    quantity: 0,
                    price: 0.0,
                    remark: String::new(),
                    submitted_at: now,
                    updated_at: now,
                    status: OrderStatus::Pending,
                    filled_quantity: 0,
                    registered: false,
                    acknowledged: false,
                })
            }
        };

        let Some(order) = state.get_mut(key) else {
            return;
        };

        if order.quantity > 0 && order.filled_quantity + report.quantity > order.quantity {
            let (filled, requested) = (order.filled_quantity, order.quantity);
            state.stats.anomalies += 1;
            tracing::error!(
                order_id = %report.order_id,
                instrument = %report.instrument,
                filled,
                requested,
                fill_quantity = report.quantity,
                "Fill would exceed requested quantity, refusing"
            );
            return;
        }
        order.filled_quantity += report.quantity;

        let fill = Fill {
            order_id: report.order_id,
            instrument: report.instrument,
            side: report.side,
            price: report.price,
            quantity: report.quantity,
            amount: report.amount,
            timestamp: Utc::now(),
        };

        tracing::info!(
            order_id = %fill.order_id,
            instrument = %fill.instrument,
            side = %fill.side,
            quantity = fill.quantity,
            price = fill.price,
            "💰 Fill"
        );

        state.stats.total_traded_amount += fill.amount;
        state.fills.push(fill.clone());
        state.outbox.push_back(OrderEvent::Traded(fill));
    }

    /// Record a venue-side failure; no order is touched
    pub fn on_error(&self, message: String) {
        {
            let mut state = self.state();
            let record = ErrorRecord {
                message,
                timestamp: Utc::now(),
            };
            tracing::error!(message = %record.message, "❌ Order error from venue");
            state.stats.failed += 1;
            state.errors.push(record.clone());
            state.outbox.push_back(OrderEvent::Error(record));
        }
        self.drain();
    }

    /// Add an observer; handlers of one kind run in registration order
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&OrderEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut observers = self.inner.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.entry(kind).or_default().push(Arc::new(handler));
    }

    fn drain(&self) {
        loop {
            let guard = match self.inner.dispatch.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
            };

            loop {
                let next = self.state().outbox.pop_front();
                match next {
                    Some(event) => self.dispatch(&event),
                    None => break,
                }
            }
            drop(guard);

            // An event queued while we were releasing the guard would otherwise wait
            if self.state().outbox.is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &OrderEvent) {
        let handlers: Vec<Handler> = {
            let observers = self.inner.observers.read().unwrap_or_else(|e| e.into_inner());
            observers.get(&event.kind()).cloned().unwrap_or_default()
        };

        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(kind = ?event.kind(), handler = index, error = %e, "Order observer failed");
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(kind = ?event.kind(), handler = index, reason = %reason, "Order observer panicked");
                }
            }
        }
    }

    pub fn statistics(&self) -> MonitorStats {
        self.state().stats.clone()
    }

    /// All recorded fills in arrival order
    pub fn fills(&self) -> Vec<Fill> {
        self.state().fills.clone()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.state().errors.clone()
    }

    pub fn order_by_seq(&self, seq: u64) -> Option<Order> {
        let state = self.state();
        let key = *state.by_seq.get(&seq)?;
        state.get(key).cloned()
    }

    pub fn order_by_id(&self, order_id: &str) -> Option<Order> {
        let state = self.state();
        let key = *state.by_order_id.get(order_id)?;
        state.get(key).cloned()
    }

    /// Orders not yet in a terminal status
    pub fn active_orders(&self) -> Vec<Order> {
        self.state().active.values().cloned().collect()
    }

    /// Archived orders, oldest first
    pub fn completed_orders(&self) -> Vec<Order> {
        self.state().archive.values().cloned().collect()
    }

    /// Log the counters
    pub fn summary(&self) -> MonitorStats {
        let stats = self.statistics();
        tracing::info!(
            submitted = stats.total_submitted,
            confirmed = stats.confirmed,
            completed = stats.completed,
            failed = stats.failed,
            anomalies = stats.anomalies,
            traded_amount = %format!("{:.2}", stats.total_traded_amount),
            "📊 Order monitor summary"
        );
        stats
    }
}

impl VenueCallbacks for OrderMonitor {
    fn on_acknowledged(&self, report: OrderReport) {
        OrderMonitor::on_acknowledged(self, report);
    }

    fn on_fill(&self, fill: FillReport) {
        OrderMonitor::on_fill(self, fill);
    }

    fn on_error(&self, message: String) {
        OrderMonitor::on_error(self, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ack(order_id: &str, seq: Option<u64>, status: OrderStatus) -> OrderReport {
        OrderReport {
            order_id: order_id.to_string(),
            seq,
            instrument: "600000.SH".to_string(),
            side: Some(Side::Buy),
            requested_quantity: None,
            status,
            remark: "test".to_string(),
        }
    }

    fn fill(order_id: &str, quantity: u64, price: f64) -> FillReport {
        FillReport {
            order_id: order_id.to_string(),
            instrument: "600000.SH".to_string(),
            side: Side::Buy,
            price,
            quantity,
            amount: price * quantity as f64,
        }
    }

    #[test]
    fn test_register_creates_pending_order() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 10.0, "open");

        let order = monitor.order_by_seq(1).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.quantity, 100);
        assert!(order.registered);
        assert_eq!(monitor.statistics().total_submitted, 1);
    }

    #[test]
    fn test_duplicate_register_is_ignored() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 10.0, "open");
        monitor.register(1, "600000.SH", Side::Sell, 300, 0.0, "dup");

        let order = monitor.order_by_seq(1).unwrap();
        assert_eq!(order.side, Some(Side::Buy));
        assert_eq!(order.quantity, 100);
        assert_eq!(monitor.statistics().total_submitted, 1);
        assert_eq!(monitor.active_orders().len(), 1);
    }

    #[test]
    fn test_full_lifecycle() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 10.0, "open");

        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        assert_eq!(monitor.order_by_id("501").unwrap().status, OrderStatus::Reported);

        monitor.on_fill(fill("501", 100, 10.05));
        // A fill alone does not move the status
        assert_eq!(monitor.order_by_id("501").unwrap().status, OrderStatus::Reported);

        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Filled));

        let stats = monitor.statistics();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.confirmed, 1);
        assert!(monitor.active_orders().is_empty());

        let completed = monitor.completed_orders();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, OrderStatus::Filled);
        assert_eq!(completed[0].seq, Some(1));
        assert_eq!(completed[0].filled_quantity, 100);

        let fills = monitor.fills();
        assert_eq!(fills.len(), 1);
        assert!((fills[0].amount - 1005.0).abs() < 1e-9);
        assert!((stats.total_traded_amount - 1005.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_acknowledgement_is_idempotent() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 0.0, "open");

        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_acknowledged(ack("501", None, OrderStatus::Reported));

        assert_eq!(monitor.statistics().confirmed, 1);
        assert_eq!(monitor.active_orders().len(), 1);
    }

    #[test]
    fn test_acknowledgement_before_register() {
        let monitor = OrderMonitor::new();
        monitor.on_acknowledged(OrderReport {
            requested_quantity: Some(200),
            ..ack("777", Some(5), OrderStatus::Reported)
        });
        monitor.register(5, "600000.SH", Side::Buy, 200, 0.0, "open");

        assert_eq!(monitor.active_orders().len(), 1);
        let order = monitor.order_by_seq(5).unwrap();
        assert_eq!(order.order_id.as_deref(), Some("777"));
        assert_eq!(order.status, OrderStatus::Reported);
        assert!(order.registered);

        let stats = monitor.statistics();
        assert_eq!(stats.total_submitted, 1);
        assert_eq!(stats.confirmed, 1);
    }

    #[test]
    fn test_register_after_completion_keeps_archive() {
        let monitor = OrderMonitor::new();
        monitor.on_acknowledged(ack("777", Some(5), OrderStatus::Filled));
        monitor.register(5, "600000.SH", Side::Buy, 100, 0.0, "open");

        assert!(monitor.active_orders().is_empty());
        assert_eq!(monitor.completed_orders().len(), 1);
        assert!(monitor.completed_orders()[0].registered);
        assert_eq!(monitor.statistics().completed, 1);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 0.0, "open");
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Cancelled));
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Filled));

        let order = monitor.order_by_id("501").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(monitor.statistics().completed, 1);
        assert_eq!(monitor.completed_orders().len(), 1);
    }

    #[test]
    fn test_partial_fill_cycle() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 300, 0.0, "open");
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_fill(fill("501", 100, 10.0));
        monitor.on_acknowledged(ack("501", None, OrderStatus::PartiallyFilled));
        monitor.on_acknowledged(ack("501", None, OrderStatus::Reported));
        assert_eq!(monitor.order_by_id("501").unwrap().status, OrderStatus::Reported);

        monitor.on_fill(fill("501", 200, 10.0));
        monitor.on_acknowledged(ack("501", None, OrderStatus::Filled));

        let order = monitor.order_by_id("501").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, 300);
    }

    #[test]
    fn test_no_regression_to_pending() {
        let monitor = OrderMonitor::new();
        monitor.on_acknowledged(ack("501", None, OrderStatus::Reported));
        monitor.on_acknowledged(ack("501", None, OrderStatus::Pending));
        assert_eq!(monitor.order_by_id("501").unwrap().status, OrderStatus::Reported);
    }

    #[test]
    fn test_conflicting_instrument_is_refused() {
        let monitor = OrderMonitor::new();
        monitor.on_acknowledged(ack("501", None, OrderStatus::Reported));
        monitor.on_acknowledged(OrderReport {
            instrument: "000001.SZ".to_string(),
            ..ack("501", None, OrderStatus::Filled)
        });

        let order = monitor.order_by_id("501").unwrap();
        assert_eq!(order.instrument, "600000.SH");
        assert_eq!(order.status, OrderStatus::Reported);
        assert_eq!(monitor.statistics().anomalies, 1);
    }

    #[test]
    fn test_fill_for_unknown_order_creates_record() {
        let monitor = OrderMonitor::new();
        monitor.on_fill(fill("900", 100, 5.0));

        let order = monitor.order_by_id("900").unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.filled_quantity, 100);

        monitor.on_acknowledged(ack("900", None, OrderStatus::Filled));
        assert_eq!(monitor.statistics().completed, 1);
        assert_eq!(monitor.statistics().confirmed, 1);
    }

    #[test]
    fn test_overfill_is_refused() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Buy, 100, 0.0, "open");
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_fill(fill("501", 100, 10.0));
        monitor.on_fill(fill("501", 100, 10.0));

        assert_eq!(monitor.fills().len(), 1);
        assert_eq!(monitor.order_by_id("501").unwrap().filled_quantity, 100);
        assert_eq!(monitor.statistics().anomalies, 1);
    }

    #[test]
    fn test_error_does_not_touch_orders() {
        let monitor = OrderMonitor::new();
        monitor.register(1, "600000.SH", Side::Sell, 100, 0.0, "close");
        monitor.on_error("insufficient position".to_string());

        let stats = monitor.statistics();
        assert_eq!(stats.failed, 1);
        assert_eq!(monitor.errors()[0].message, "insufficient position");
        assert_eq!(monitor.order_by_seq(1).unwrap().status, OrderStatus::Pending);
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let monitor = OrderMonitor::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            monitor.subscribe(EventKind::Confirmed, move |_| {
                calls.lock().unwrap().push(name);
                Ok(())
            });
        }

        monitor.on_acknowledged(ack("501", None, OrderStatus::Reported));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_observer_does_not_stop_dispatch() {
        let monitor = OrderMonitor::new();
        let reached = Arc::new(AtomicUsize::new(0));

        monitor.subscribe(EventKind::Traded, |_| anyhow::bail!("observer error"));
        monitor.subscribe(EventKind::Traded, |_| panic!("observer panic"));
        {
            let reached = reached.clone();
            monitor.subscribe(EventKind::Traded, move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        monitor.on_fill(fill("501", 100, 10.0));
        monitor.on_fill(fill("502", 100, 10.0));

        assert_eq!(reached.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.fills().len(), 2);
        assert_eq!(monitor.statistics().total_traded_amount, 2000.0);
    }

    #[test]
    fn test_reentrant_observer_does_not_deadlock() {
        let monitor = OrderMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let inner = monitor.clone();
            let seen = seen.clone();
            monitor.subscribe(EventKind::Completed, move |event| {
                let stats = inner.statistics();
                seen.lock().unwrap().push(stats.completed);
                if let OrderEvent::Completed(order) = event {
                    inner.on_error(format!("follow-up for {:?}", order.order_id));
                }
                Ok(())
            });
        }
        {
            let seen = seen.clone();
            monitor.subscribe(EventKind::Error, move |_| {
                seen.lock().unwrap().push(100);
                Ok(())
            });
        }

        monitor.on_acknowledged(ack("501", None, OrderStatus::Filled));

        assert_eq!(*seen.lock().unwrap(), vec![1, 100]);
        assert_eq!(monitor.statistics().failed, 1);
    }

    #[test]
    fn test_events_arrive_in_order_per_order() {
        let monitor = OrderMonitor::new();
        let kinds = Arc::new(Mutex::new(Vec::new()));

        for kind in [EventKind::Confirmed, EventKind::Traded, EventKind::Completed] {
            let kinds = kinds.clone();
            monitor.subscribe(kind, move |event| {
                kinds.lock().unwrap().push(event.kind());
                Ok(())
            });
        }

        monitor.register(1, "600000.SH", Side::Buy, 100, 10.0, "open");
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Reported));
        monitor.on_fill(fill("501", 100, 10.05));
        monitor.on_acknowledged(ack("501", Some(1), OrderStatus::Filled));

        assert_eq!(
            *kinds.lock().unwrap(),
            vec![EventKind::Confirmed, EventKind::Traded, EventKind::Completed]
        );
    }

    #[test]
    fn test_concurrent_delivery_threads() {
        use std::thread;

        let monitor = OrderMonitor::new();
        let completed_events = Arc::new(AtomicUsize::new(0));
        {
            let completed_events = completed_events.clone();
            monitor.subscribe(EventKind::Completed, move |_| {
                completed_events.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        for seq in 0..200u64 {
            monitor.register(seq, "600000.SH", Side::Buy, 100, 0.0, "open");
        }

        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let monitor = monitor.clone();
                thread::spawn(move || {
                    for seq in (worker * 50)..((worker + 1) * 50) {
                        let order_id = format!("V{}", seq);
                        monitor.on_acknowledged(ack(&order_id, Some(seq), OrderStatus::Reported));
                        monitor.on_fill(fill(&order_id, 100, 1.0));
                        monitor.on_acknowledged(ack(&order_id, Some(seq), OrderStatus::Filled));
                        let _ = monitor.statistics();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = monitor.statistics();
        assert_eq!(stats.completed, 200);
        assert_eq!(stats.confirmed, 200);
        assert_eq!(monitor.completed_orders().len(), 200);
        assert_eq!(completed_events.load(Ordering::SeqCst), 200);
        assert_eq!(stats.total_traded_amount, 20_000.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u64),
        Ack(u64, OrderStatus),
        Fill(u64),
    }

    #[test]
    fn test_any_interleaving_keeps_terminal_states() {
        let mut rng = StdRng::seed_from_u64(20260105);
        let statuses = [
            OrderStatus::Reported,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
        ];

        for _ in 0..200 {
            let monitor = OrderMonitor::new();
            let mut ops = Vec::new();
            for seq in 0..5u64 {
                ops.push(Op::Register(seq));
                for _ in 0..4 {
                    let status = *statuses.choose(&mut rng).unwrap();
                    ops.push(Op::Ack(seq, status));
                }
                ops.push(Op::Fill(seq));
            }
            ops.shuffle(&mut rng);

            let mut first_terminal: HashMap<u64, OrderStatus> = HashMap::new();
            for op in &ops {
                match op {
                    Op::Register(seq) => monitor.register(*seq, "600000.SH", Side::Buy, 100, 0.0, "p"),
                    Op::Ack(seq, status) => {
                        if status.is_terminal() {
                            first_terminal.entry(*seq).or_insert(*status);
                        }
                        monitor.on_acknowledged(ack(&format!("V{}", seq), Some(*seq), *status));
                    }
                    Op::Fill(seq) => monitor.on_fill(fill(&format!("V{}", seq), 100, 1.0)),
                }
            }

            let stats = monitor.statistics();
            let archived = monitor.completed_orders();
            assert_eq!(stats.completed as usize, archived.len());
            assert_eq!(stats.total_submitted, 5);
            assert_eq!(archived.len(), first_terminal.len());
            assert_eq!(monitor.active_orders().len() + archived.len(), 5);

            for order in &archived {
                let seq = order.seq.unwrap();
                assert_eq!(Some(&order.status), first_terminal.get(&seq));
            }
            for order in monitor.active_orders() {
                assert!(!order.is_terminal());
            }
        }
    }
}
