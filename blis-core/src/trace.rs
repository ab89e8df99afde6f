//! Optional per-routing-decision trace, for counterfactual analysis.

use crate::request::{InstanceId, RequestId};
use serde::Serialize;
use slotmap::Key;

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecisionRecord {
    pub request_id: RequestId,
    pub timestamp: i64,
    pub target: InstanceId,
    /// `(instance, composite score)` for every candidate considered.
    pub scorer_scores: Vec<(InstanceId, f64)>,
    /// The `k` highest-scoring candidates, descending.
    pub top_k_candidates: Vec<(InstanceId, f64)>,
    /// `best_score - chosen_score`; 0.0 when the chosen target was already
    /// the top scorer.
    pub regret: f64,
}

impl RoutingDecisionRecord {
    pub fn new(
        request_id: RequestId,
        timestamp: i64,
        target: InstanceId,
        scorer_scores: Vec<(InstanceId, f64)>,
        top_k: usize,
    ) -> Self {
        let mut ranked = scorer_scores.clone();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let best_score = ranked.first().map(|(_, s)| *s).unwrap_or(0.0);
        let chosen_score = scorer_scores
            .iter()
            .find(|(id, _)| *id == target)
            .map(|(_, s)| *s)
            .unwrap_or(0.0);

        Self {
            request_id,
            timestamp,
            target,
            top_k_candidates: ranked.into_iter().take(top_k).collect(),
            scorer_scores,
            regret: (best_score - chosen_score).max(0.0),
        }
    }
}

/// Disabled by default — a run pays no tracing cost unless asked for one.
pub struct Trace {
    enabled: bool,
    records: Vec<RoutingDecisionRecord>,
}

impl Trace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, record: RoutingDecisionRecord) {
        if self.enabled {
            self.records.push(record);
        }
    }

    pub fn records(&self) -> &[RoutingDecisionRecord] {
        &self.records
    }

    pub fn summarize(&self) -> TraceSummary {
        let mut target_counts: Vec<(u64, usize)> = Vec::new();
        for record in &self.records {
            let ffi = record.target.data().as_ffi();
            match target_counts.iter_mut().find(|(id, _)| *id == ffi) {
                Some((_, count)) => *count += 1,
                None => target_counts.push((ffi, 1)),
            }
        }
        target_counts.sort_by_key(|(id, _)| *id);

        let regrets: Vec<f64> = self.records.iter().map(|r| r.regret).collect();
        let mean_regret = if regrets.is_empty() {
            0.0
        } else {
            regrets.iter().sum::<f64>() / regrets.len() as f64
        };
        let max_regret = regrets.iter().cloned().fold(0.0_f64, f64::max);

        TraceSummary {
            decisions: self.records.len(),
            unique_targets: target_counts.len(),
            target_distribution: target_counts,
            mean_regret,
            max_regret,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub decisions: usize,
    pub unique_targets: usize,
    /// `(instance ffi id, count)`, sorted by id for determinism (`INV-6`).
    pub target_distribution: Vec<(u64, usize)>,
    pub mean_regret: f64,
    pub max_regret: f64,
}
