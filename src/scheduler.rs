//! Job scheduling around the rebalancer
//!
//! Every job takes the same async mutex, so `rebalance`, the risk pass and
//! the limit-up pass never overlap. Each job runs inside a span carrying a
//! fresh run id. An optional session hook runs once per new date before any
//! job sees it, which is where a venue rolls its trading day.

use chrono::{Datelike, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::models::Candidate;
use crate::portfolio::{PortfolioRebalancer, RebalanceSummary, RiskSummary};
use crate::selection::CandidateSelector;
use crate::Result;

/// Called with each new session date before that date's jobs run
pub type SessionHook = Arc<dyn Fn(NaiveDate) -> Result<()> + Send + Sync>;

struct Jobs {
    rebalancer: PortfolioRebalancer,
    last_rebalance: Option<NaiveDate>,
    last_refresh: Option<NaiveDate>,
    last_session: Option<NaiveDate>,
}

impl Jobs {
    /// Refresh the limit-up exemption set once per session
    async fn ensure_exemptions(&mut self, as_of: NaiveDate) {
        if self.last_refresh == Some(as_of) {
            return;
        }
        match self.rebalancer.refresh_limit_up_exemptions(as_of).await {
            Ok(_) => self.last_refresh = Some(as_of),
            Err(e) => tracing::error!(error = %e, "Limit-up refresh failed"),
        }
    }
}

/// Outcome of one simulated trading day
#[derive(Debug, Clone, Default)]
pub struct DayReport {
    pub rebalance: Option<RebalanceSummary>,
    pub limit_up: Option<RiskSummary>,
    pub risk: Option<RiskSummary>,
}

#[derive(Clone)]
pub struct Scheduler {
    jobs: Arc<Mutex<Jobs>>,
    selector: Arc<dyn CandidateSelector>,
    config: ScheduleConfig,
    session_hook: Option<SessionHook>,
}

impl Scheduler {
    pub fn new(
        rebalancer: PortfolioRebalancer,
        selector: Arc<dyn CandidateSelector>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Jobs {
                rebalancer,
                last_rebalance: None,
                last_refresh: None,
                last_session: None,
            })),
            selector,
            config,
            session_hook: None,
        }
    }

    pub fn with_session_hook(mut self, hook: impl Fn(NaiveDate) -> Result<()> + Send + Sync + 'static) -> Self {
        self.session_hook = Some(Arc::new(hook));
        self
    }

    /// Start the session for `as_of` unless it is already current
    ///
    /// Returns true when a new session began. A failing hook leaves the
    /// previous session current so the next call retries.
    pub async fn begin_session(&self, as_of: NaiveDate) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.last_session.is_some_and(|current| current >= as_of) {
            return false;
        }

        if let Some(hook) = &self.session_hook {
            if let Err(e) = hook(as_of) {
                tracing::error!(%as_of, error = %e, "Session start failed");
                return false;
            }
        }

        jobs.last_session = Some(as_of);
        tracing::info!(%as_of, "📅 New trading session");
        true
    }

    pub fn is_rebalance_day(&self, as_of: NaiveDate) -> bool {
        self.config.rebalance_days.contains(&as_of.day())
    }

    /// Run `f` against the rebalancer under the single-flight guard
    pub async fn with_rebalancer<R>(&self, f: impl FnOnce(&PortfolioRebalancer) -> R) -> R {
        let jobs = self.jobs.lock().await;
        f(&jobs.rebalancer)
    }

    async fn select_candidates(&self, as_of: NaiveDate) -> Vec<Candidate> {
        match self.selector.select_candidates(as_of).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(
                    selector = self.selector.name(),
                    error = %e,
                    "Candidate selection failed, continuing with an empty target list"
                );
                Vec::new()
            }
        }
    }

    /// Rebalance if `as_of` is a configured day and it has not run yet that day
    pub async fn rebalance_job(&self, as_of: NaiveDate) -> Option<RebalanceSummary> {
        if !self.is_rebalance_day(as_of) {
            return None;
        }
        self.rebalance_now(as_of).await
    }

    /// Rebalance regardless of the calendar, still at most once per day
    pub async fn rebalance_now(&self, as_of: NaiveDate) -> Option<RebalanceSummary> {
        let span = tracing::info_span!("scheduler_job", job = "rebalance", run_id = %Uuid::new_v4(), %as_of);
        async move {
            let mut jobs = self.jobs.lock().await;
            if jobs.last_rebalance == Some(as_of) {
                return None;
            }

            let candidates = self.select_candidates(as_of).await;
            jobs.ensure_exemptions(as_of).await;

            match jobs.rebalancer.rebalance(&candidates, as_of).await {
                Ok(summary) => {
                    jobs.last_rebalance = Some(as_of);
                    Some(summary)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Rebalance aborted, account state unavailable");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn risk_job(&self, as_of: NaiveDate) -> Option<RiskSummary> {
        let span = tracing::info_span!("scheduler_job", job = "risk_control", run_id = %Uuid::new_v4(), %as_of);
        async move {
            let mut jobs = self.jobs.lock().await;
            jobs.ensure_exemptions(as_of).await;
            match jobs.rebalancer.check_risk_control(as_of).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::error!(error = %e, "Risk pass aborted, account state unavailable");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn limit_up_job(&self, as_of: NaiveDate) -> Option<RiskSummary> {
        let span = tracing::info_span!("scheduler_job", job = "limit_up", run_id = %Uuid::new_v4(), %as_of);
        async move {
            let mut jobs = self.jobs.lock().await;
            jobs.ensure_exemptions(as_of).await;
            match jobs.rebalancer.handle_limit_up_instruments(as_of).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    tracing::error!(error = %e, "Limit-up pass aborted, account state unavailable");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// All jobs for one session, in the order a trading day runs them
    pub async fn run_day(&self, as_of: NaiveDate) -> DayReport {
        let rebalance = self.rebalance_job(as_of).await;
        let limit_up = self.limit_up_job(as_of).await;
        let risk = self.risk_job(as_of).await;
        DayReport {
            rebalance,
            limit_up,
            risk,
        }
    }

    /// Interval loop against the wall clock until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut risk_tick = tokio::time::interval(Duration::from_secs(self.config.risk_check_interval_secs.max(1)));
        let mut limit_up_tick =
            tokio::time::interval(Duration::from_secs(self.config.limit_up_check_interval_secs.max(1)));
        risk_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        limit_up_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            risk_every_secs = self.config.risk_check_interval_secs,
            limit_up_every_secs = self.config.limit_up_check_interval_secs,
            rebalance_days = ?self.config.rebalance_days,
            "⏰ Scheduler started"
        );

        loop {
            tokio::select! {
                _ = risk_tick.tick() => {
                    let today = Utc::now().date_naive();
                    self.begin_session(today).await;
                    self.rebalance_job(today).await;
                    self.risk_job(today).await;
                }
                _ = limit_up_tick.tick() => {
                    let today = Utc::now().date_naive();
                    self.begin_session(today).await;
                    self.limit_up_job(today).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }
}
