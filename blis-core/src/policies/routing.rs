//! Picks which instance a newly admitted request is sent to.

use super::scorers::Scorer;
use super::PolicyError;
use crate::request::{InstanceId, Request};
use crate::snapshot::RouterState;

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub instance_id: InstanceId,
    pub reason: &'static str,
    /// Per-instance composite scores considered for this decision, empty
    /// for policies that don't compute one (round-robin, least-loaded,
    /// always-busiest). Feeds `Trace`'s regret calculation.
    pub scorer_scores: Vec<(InstanceId, f64)>,
}

pub trait RoutingPolicy {
    /// `None` only if `state.snapshots` is empty; callers are expected to
    /// never route with zero instances in the cluster.
    fn route(&mut self, request: &Request, state: &RouterState) -> Option<RoutingDecision>;
}

/// Cycles through instances in snapshot order, independent of load.
#[derive(Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, _request: &Request, state: &RouterState) -> Option<RoutingDecision> {
        if state.snapshots.is_empty() {
            return None;
        }
        let idx = self.next % state.snapshots.len();
        self.next = self.next.wrapping_add(1);
        Some(RoutingDecision {
            instance_id: state.snapshots[idx].instance_id,
            reason: "round-robin",
            scorer_scores: Vec::new(),
        })
    }
}

/// Sends to the instance with the lowest `queue_depth + batch_size`, ties
/// broken by snapshot order.
pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, _request: &Request, state: &RouterState) -> Option<RoutingDecision> {
        state
            .snapshots
            .iter()
            .min_by_key(|s| s.queue_depth + s.batch_size)
            .map(|s| RoutingDecision {
                instance_id: s.instance_id,
                reason: "least-loaded",
                scorer_scores: Vec::new(),
            })
    }
}

/// Pathological: always the most loaded instance, exercising the
/// anti-work-conserving policy-mismatch scenario.
pub struct AlwaysBusiest;

impl RoutingPolicy for AlwaysBusiest {
    fn route(&mut self, _request: &Request, state: &RouterState) -> Option<RoutingDecision> {
        state
            .snapshots
            .iter()
            .max_by_key(|s| s.queue_depth + s.batch_size)
            .map(|s| RoutingDecision {
                instance_id: s.instance_id,
                reason: "always-busiest",
                scorer_scores: Vec::new(),
            })
    }
}

/// Binary prefix affinity: route to any instance the index believes holds a
/// cache hit for this request's first prefix block, falling back to
/// least-loaded when no instance matches.
pub struct PrefixAffinityBinary {
    scorer: super::PrefixAffinityScorer,
    fallback: LeastLoaded,
}

impl PrefixAffinityBinary {
    pub fn new(scorer: super::PrefixAffinityScorer) -> Self {
        Self {
            scorer,
            fallback: LeastLoaded,
        }
    }
}

impl RoutingPolicy for PrefixAffinityBinary {
    fn route(&mut self, request: &Request, state: &RouterState) -> Option<RoutingDecision> {
        let scores = self.scorer.score(request, state);
        let best = scores
            .iter()
            .filter(|(_, &score)| score > 0.0)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap());

        match best {
            Some((&instance_id, _)) => Some(RoutingDecision {
                instance_id,
                reason: "prefix-affinity: hit",
                scorer_scores: scores.into_iter().collect(),
            }),
            None => self.fallback.route(request, state).map(|d| RoutingDecision {
                reason: "prefix-affinity: miss, fell back to least-loaded",
                ..d
            }),
        }
    }
}

/// One scorer with its normalized weight, as validated by `Weighted::new`.
struct WeightedScorer {
    scorer: Box<dyn Scorer>,
    weight: f64,
}

/// Composite scorer pipeline: `score(instance) = Σ clamp(scorer_i) * weight_i`,
/// argmax wins, ties broken by snapshot order.
pub struct Weighted {
    scorers: Vec<WeightedScorer>,
}

impl Weighted {
    /// Validates and normalizes `(scorer, weight)` pairs so weights sum to
    /// 1.0. Rejects NaN, infinite, negative, or all-zero weights, and an
    /// empty scorer list.
    pub fn new(scorers: Vec<(Box<dyn Scorer>, f64)>) -> Result<Self, PolicyError> {
        if scorers.is_empty() {
            return Err(PolicyError::InvalidWeight {
                name: "weighted".to_string(),
                reason: "at least one scorer is required",
            });
        }
        for (scorer, weight) in &scorers {
            if weight.is_nan() || weight.is_infinite() {
                return Err(PolicyError::InvalidWeight {
                    name: scorer.name().to_string(),
                    reason: "weight must be finite",
                });
            }
            if *weight < 0.0 {
                return Err(PolicyError::InvalidWeight {
                    name: scorer.name().to_string(),
                    reason: "weight must be non-negative",
                });
            }
        }
        let total: f64 = scorers.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Err(PolicyError::InvalidWeight {
                name: "weighted".to_string(),
                reason: "sum of weights must be positive",
            });
        }

        let scorers = scorers
            .into_iter()
            .map(|(scorer, weight)| WeightedScorer {
                scorer,
                weight: weight / total,
            })
            .collect();
        Ok(Self { scorers })
    }
}

impl RoutingPolicy for Weighted {
    fn route(&mut self, request: &Request, state: &RouterState) -> Option<RoutingDecision> {
        if state.snapshots.is_empty() {
            return None;
        }

        let mut totals: std::collections::HashMap<InstanceId, f64> = state
            .snapshots
            .iter()
            .map(|s| (s.instance_id, 0.0))
            .collect();

        for weighted in &mut self.scorers {
            let scores = weighted.scorer.score(request, state);
            for (instance_id, total) in totals.iter_mut() {
                let raw = scores.get(instance_id).copied().unwrap_or(0.0);
                *total += raw.clamp(0.0, 1.0) * weighted.weight;
            }
        }

        let scorer_scores: Vec<(InstanceId, f64)> = state
            .snapshots
            .iter()
            .map(|s| (s.instance_id, totals[&s.instance_id]))
            .collect();

        scorer_scores
            .iter()
            .copied()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(instance_id, _)| RoutingDecision {
                instance_id,
                reason: "weighted",
                scorer_scores,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::scorers::{KvUtilizationScorer, QueueDepthScorer};
    use crate::request::{RequestId, SloClass};
    use slotmap::SlotMap;

    fn instance_id() -> InstanceId {
        let mut sm: SlotMap<InstanceId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    fn req() -> Request {
        let mut sm: SlotMap<RequestId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        Request::new(id, 0, vec![1], vec![1], "t".to_string(), SloClass::Interactive, 0.0)
    }

    fn snap(id: InstanceId, queue_depth: u32, kv_utilization: f64) -> crate::snapshot::Snapshot {
        crate::snapshot::Snapshot {
            instance_id: id,
            timestamp: 0,
            queue_depth,
            batch_size: 0,
            kv_utilization,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            pending_requests: 0,
        }
    }

    #[test]
    fn round_robin_cycles_through_instances() {
        let a = instance_id();
        let b = instance_id();
        let state = RouterState {
            clock: 0,
            snapshots: vec![snap(a, 0, 0.0), snap(b, 0, 0.0)],
        };
        let mut policy = RoundRobin::default();
        let r = req();
        let first = policy.route(&r, &state).unwrap().instance_id;
        let second = policy.route(&r, &state).unwrap().instance_id;
        let third = policy.route(&r, &state).unwrap().instance_id;
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert_eq!(third, a);
    }

    #[test]
    fn least_loaded_prefers_the_lighter_instance() {
        let a = instance_id();
        let b = instance_id();
        let state = RouterState {
            clock: 0,
            snapshots: vec![snap(a, 10, 0.0), snap(b, 1, 0.0)],
        };
        let decision = LeastLoaded.route(&req(), &state).unwrap();
        assert_eq!(decision.instance_id, b);
    }

    #[test]
    fn weighted_rejects_negative_weight() {
        let result = Weighted::new(vec![(Box::new(QueueDepthScorer), -1.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn weighted_rejects_nan_weight() {
        let result = Weighted::new(vec![(Box::new(QueueDepthScorer), f64::NAN)]);
        assert!(result.is_err());
    }

    #[test]
    fn weighted_normalization_is_identity_preserving() {
        // Doubling every weight must not change the routing decision.
        let a = instance_id();
        let b = instance_id();
        let state = RouterState {
            clock: 0,
            snapshots: vec![snap(a, 0, 0.9), snap(b, 5, 0.1)],
        };

        let mut unscaled = Weighted::new(vec![
            (Box::new(QueueDepthScorer), 1.0),
            (Box::new(KvUtilizationScorer), 1.0),
        ])
        .unwrap();
        let mut scaled = Weighted::new(vec![
            (Box::new(QueueDepthScorer), 2.0),
            (Box::new(KvUtilizationScorer), 2.0),
        ])
        .unwrap();

        let r = req();
        assert_eq!(
            unscaled.route(&r, &state).unwrap().instance_id,
            scaled.route(&r, &state).unwrap().instance_id
        );
    }
}
