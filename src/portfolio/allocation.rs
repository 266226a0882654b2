use serde::Serialize;

use crate::models::Candidate;

/// Cash earmarked for one instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub instrument: String,
    pub weight: f64,
    pub amount: f64,
}

/// Score-proportional weights
///
/// Non-positive or non-finite scores get no weight. When nothing carries
/// weight every candidate gets an equal share.
pub fn score_weights(candidates: &[Candidate]) -> Vec<f64> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let scores: Vec<f64> = candidates
        .iter()
        .map(|c| if c.score.is_finite() && c.score > 0.0 { c.score } else { 0.0 })
        .collect();
    let total: f64 = scores.iter().sum();

    if total > 0.0 && total.is_finite() {
        scores.iter().map(|s| s / total).collect()
    } else {
        vec![1.0 / candidates.len() as f64; candidates.len()]
    }
}

/// Split `cash` over the first `slots` candidates
pub fn allocate(candidates: &[Candidate], cash: f64, slots: usize) -> Vec<Allocation> {
    if cash <= 0.0 || slots == 0 {
        return Vec::new();
    }

    let selected = &candidates[..candidates.len().min(slots)];
    score_weights(selected)
        .into_iter()
        .zip(selected)
        .map(|(weight, candidate)| Allocation {
            instrument: candidate.instrument.clone(),
            weight,
            amount: cash * weight,
        })
        .collect()
}
