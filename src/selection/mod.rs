// Candidate selection: the scoring model lives behind this trait
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;

use crate::market_data::{trailing_bars, MarketData};
use crate::models::Candidate;
use crate::{BotError, Result};

/// Source of the ranked target list for one rebalancing cycle
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    /// Candidates ordered best first
    async fn select_candidates(&self, as_of: NaiveDate) -> Result<Vec<Candidate>>;

    fn name(&self) -> &str;
}

/// Fixed candidate list, e.g. exported by an offline model run
#[derive(Debug, Clone, Default)]
pub struct StaticSelector {
    candidates: Vec<Candidate>,
}

impl StaticSelector {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    /// Load a JSON array of `{"instrument": ..., "score": ...}`
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let candidates: Vec<Candidate> = serde_json::from_str(&raw)?;
        Ok(Self::new(candidates))
    }
}

#[async_trait]
impl CandidateSelector for StaticSelector {
    async fn select_candidates(&self, _as_of: NaiveDate) -> Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Ranks the reference universe by trailing return
///
/// Only instruments with a positive return over `lookback` bars qualify;
/// the return itself is the score.
pub struct MomentumSelector {
    market_data: Arc<dyn MarketData>,
    lookback: usize,
    top_k: usize,
}

impl MomentumSelector {
    pub fn new(market_data: Arc<dyn MarketData>, lookback: usize, top_k: usize) -> Self {
        Self {
            market_data,
            lookback: lookback.max(1),
            top_k,
        }
    }
}

#[async_trait]
impl CandidateSelector for MomentumSelector {
    async fn select_candidates(&self, as_of: NaiveDate) -> Result<Vec<Candidate>> {
        let universe = self.market_data.reference_universe().await?;
        if universe.is_empty() {
            return Err(BotError::Selection("empty reference universe".to_string()));
        }

        let mut ranked = Vec::new();
        for instrument in universe {
            let bars = trailing_bars(self.market_data.as_ref(), &instrument, as_of, self.lookback + 1).await?;
            if bars.len() <= self.lookback {
                continue;
            }
            let (first, last) = (bars[0].close, bars[bars.len() - 1].close);
            if first <= 0.0 {
                continue;
            }
            let ret = last / first - 1.0;
            if ret > 0.0 {
                ranked.push(Candidate::new(instrument, ret));
            }
        }

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.top_k);

        tracing::info!(
            %as_of,
            selected = ranked.len(),
            lookback = self.lookback,
            "🎯 Momentum candidates selected"
        );
        Ok(ranked)
    }

    fn name(&self) -> &str {
        "momentum"
    }
}
