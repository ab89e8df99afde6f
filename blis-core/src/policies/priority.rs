//! Assigns a numeric priority score to a queued request.

use crate::request::{Request, SloClass};

pub trait PriorityPolicy {
    fn compute(&self, request: &Request, clock: i64) -> f64;
}

/// Every request gets the same score (order falls back to whatever the
/// batch scheduler does with ties, typically arrival order).
#[derive(Default)]
pub struct Constant(pub f64);

impl PriorityPolicy for Constant {
    fn compute(&self, _request: &Request, _clock: i64) -> f64 {
        self.0
    }
}

fn slo_base_score(slo_class: SloClass) -> f64 {
    match slo_class {
        SloClass::Interactive => 3.0,
        SloClass::Batch => 2.0,
        SloClass::BestEffort => 1.0,
    }
}

/// Higher score for higher-priority SLO classes; ties broken by caller.
pub struct SloBased;

impl PriorityPolicy for SloBased {
    fn compute(&self, request: &Request, _clock: i64) -> f64 {
        slo_base_score(request.slo_class)
    }
}

/// Pathological: inverts the SLO ordering, so best-effort requests score
/// highest. Exists to exercise policy-mismatch test scenarios and priority
/// inversion anomaly counting, not recommended for real configurations.
pub struct InvertedSlo;

impl PriorityPolicy for InvertedSlo {
    fn compute(&self, request: &Request, _clock: i64) -> f64 {
        4.0 - slo_base_score(request.slo_class)
    }
}

/// Pathological: negates whatever `priority_hint` the request arrived with.
pub struct ReversePriority;

impl PriorityPolicy for ReversePriority {
    fn compute(&self, request: &Request, _clock: i64) -> f64 {
        -request.priority_hint
    }
}
