use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use quantbot::config::{AppConfig, LoggingConfig};
use quantbot::execution::{ExecutionGateway, OrderMonitor, PaperGateway};
use quantbot::market_data::{CandleStore, MarketData, SyntheticMarket};
use quantbot::portfolio::PortfolioRebalancer;
use quantbot::risk::RiskController;
use quantbot::scheduler::Scheduler;
use quantbot::selection::MomentumSelector;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const MOMENTUM_LOOKBACK: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "quantbot")]
#[command(version = "0.1.0")]
#[command(about = "Rebalancing and risk-control engine for a long-only equity book", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay sessions of a synthetic market through the paper venue
    Demo {
        /// Sessions to replay after the warm-up history
        #[arg(long, default_value_t = 60)]
        days: usize,
    },
    /// Paper smoke run: the wall-clock scheduler against a synthetic market
    /// ending today, until Ctrl+C
    Run,
}

/// Everything the jobs need, wired against the paper venue
struct PaperWorld {
    scheduler: Scheduler,
    gateway: Arc<PaperGateway>,
    monitor: OrderMonitor,
    replay: Vec<NaiveDate>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Demo { days } => run_demo(&config, days).await,
        Commands::Run => run_live(&config).await,
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("quantbot={}", logging.level)));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }
}

/// Synthetic market from `start`, with the paper venue rolled by the scheduler's session hook
fn build_world(config: &AppConfig, start: NaiveDate, replay_days: usize) -> anyhow::Result<PaperWorld> {
    let universe: Vec<String> = (0..config.paper.universe_size)
        .map(|i| format!("{}.SH", 600_000 + i))
        .collect();

    let sessions = SyntheticMarket::sessions(start, config.paper.history_days + replay_days.max(1));
    let replay = sessions[config.paper.history_days..].to_vec();
    let first_session = *replay.first().context("no sessions to replay")?;

    let store = CandleStore::new();
    SyntheticMarket::new(config.paper.seed).populate(
        &store,
        &universe,
        &config.risk.index_proxy,
        start,
        sessions.len(),
    )?;

    let monitor = OrderMonitor::new();
    let gateway = Arc::new(PaperGateway::new(
        store.clone(),
        Arc::new(monitor.clone()),
        config.paper.initial_cash,
        config.portfolio.lot_size,
        first_session,
    ));

    let market_data: Arc<dyn MarketData> = Arc::new(store);
    let rebalancer = PortfolioRebalancer::new(
        gateway.clone(),
        monitor.clone(),
        RiskController::new(market_data.clone(), config.risk.clone()),
        market_data.clone(),
        config.portfolio.clone(),
    );
    let selector = Arc::new(MomentumSelector::new(
        market_data,
        MOMENTUM_LOOKBACK,
        config.portfolio.max_holdings * 2,
    ));

    let venue = gateway.clone();
    let scheduler = Scheduler::new(rebalancer, selector, config.schedule.clone()).with_session_hook(move |as_of| {
        venue.set_date(as_of)?;
        venue.settle()
    });

    Ok(PaperWorld {
        scheduler,
        gateway,
        monitor,
        replay,
    })
}

async fn run_demo(config: &AppConfig, days: usize) -> anyhow::Result<()> {
    let start = NaiveDate::from_ymd_opt(2024, 1, 2).context("invalid start date")?;
    let world = build_world(config, start, days)?;
    world.gateway.connect().await?;

    tracing::info!(
        sessions = world.replay.len(),
        universe = config.paper.universe_size,
        initial_cash = config.paper.initial_cash,
        "🚀 Replaying synthetic sessions"
    );

    for (i, &session) in world.replay.iter().enumerate() {
        if !world.scheduler.begin_session(session).await {
            anyhow::bail!("could not start session {}", session);
        }

        if i == 0 {
            world.scheduler.rebalance_now(session).await;
        }
        let report = world.scheduler.run_day(session).await;

        let risk_exits = report.risk.as_ref().map(|r| r.events.len()).unwrap_or(0);
        let limit_up_exits = report.limit_up.as_ref().map(|r| r.events.len()).unwrap_or(0);
        if report.rebalance.is_some() || risk_exits > 0 || limit_up_exits > 0 {
            tracing::info!(
                %session,
                rebalanced = report.rebalance.is_some(),
                risk_exits,
                limit_up_exits,
                "Session done"
            );
        }
    }

    world.monitor.summary();
    let account = world.gateway.account_info().await?;
    let positions = world.gateway.positions().await?;

    println!("\n📊 Paper account after {} sessions", world.replay.len());
    println!("  Cash:         {:>14.2}", account.cash);
    println!("  Market value: {:>14.2}", account.market_value);
    println!("  Total asset:  {:>14.2}", account.total_asset);
    println!(
        "  Return:       {:>13.2}%",
        (account.total_asset / config.paper.initial_cash - 1.0) * 100.0
    );
    println!("  Holdings:     {:>14}", positions.len());
    for position in &positions {
        println!(
            "    {:<10} {:>8} shares  value {:>12.2}",
            position.instrument, position.quantity, position.market_value
        );
    }

    Ok(())
}

async fn run_live(config: &AppConfig) -> anyhow::Result<()> {
    // Enough calendar days for the warm-up sessions to end around today
    let today = Utc::now().date_naive();
    let span = (config.paper.history_days as i64) * 7 / 5 + 7;
    let world = build_world(config, today - Duration::days(span), 10)?;
    world.gateway.connect().await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = world.scheduler.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tracing::info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");

    shutdown_tx.send(()).ok();
    handle.await?;

    world.monitor.summary();
    tracing::info!("👋 quantbot stopped");
    Ok(())
}
