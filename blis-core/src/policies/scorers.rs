//! Per-instance scoring functions composed by the `weighted` routing policy.

use crate::kv_cache::chained_block_hash;
use crate::request::{InstanceId, Request};
use crate::snapshot::RouterState;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// A scorer returns per-instance scores in `[0, 1]`.
pub trait Scorer {
    fn name(&self) -> &'static str;
    fn score(&mut self, request: &Request, state: &RouterState) -> HashMap<InstanceId, f64>;
}

fn min_max_normalize(values: &HashMap<InstanceId, f64>) -> HashMap<InstanceId, f64> {
    let min = values.values().cloned().fold(f64::INFINITY, f64::min);
    let max = values.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|(&id, &v)| {
            let normalized = if span > 0.0 { (v - min) / span } else { 0.0 };
            (id, normalized)
        })
        .collect()
}

/// Effective load = `queue_depth + batch_size` (Tier 1+2 composite), plus
/// `pending_requests` (synchronous Tier 1) to compensate for Tier 2
/// staleness: a request routed but not yet reflected in `queue_depth`/
/// `batch_size` still counts against the instance immediately.
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &'static str {
        "queue-depth"
    }

    fn score(&mut self, _request: &Request, state: &RouterState) -> HashMap<InstanceId, f64> {
        let load: HashMap<InstanceId, f64> = state
            .snapshots
            .iter()
            .map(|s| {
                (
                    s.instance_id,
                    (s.queue_depth + s.batch_size + s.pending_requests) as f64,
                )
            })
            .collect();
        min_max_normalize(&load)
            .into_iter()
            .map(|(id, norm)| (id, (1.0 - norm).clamp(0.0, 1.0)))
            .collect()
    }
}

/// `1 - utilization`. Stale across batch steps (Tier 3): `kv_utilization` is
/// only as fresh as the snapshot's refresh mode allows, unlike
/// `pending_requests` which `QueueDepthScorer` reads synchronously.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &'static str {
        "kv-utilization"
    }

    fn score(&mut self, _request: &Request, state: &RouterState) -> HashMap<InstanceId, f64> {
        state
            .snapshots
            .iter()
            .map(|s| (s.instance_id, (1.0 - s.kv_utilization).clamp(0.0, 1.0)))
            .collect()
    }
}

/// `1 / (1 + load)` inverse transform (Tier 1+2).
pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn score(&mut self, _request: &Request, state: &RouterState) -> HashMap<InstanceId, f64> {
        state
            .snapshots
            .iter()
            .map(|s| {
                let load = (s.queue_depth + s.batch_size) as f64;
                (s.instance_id, 1.0 / (1.0 + load))
            })
            .collect()
    }
}

/// Router-side approximate prefix cache index: a map from block hash to the
/// set of instances observed to hold that block, with per-instance LRU
/// eviction. This index is intentionally approximate — it diverges from
/// actual instance cache state under eviction, which mirrors the
/// information asymmetry a real production router faces.
pub struct PrefixAffinityIndex {
    block_size_tokens: usize,
    capacity_per_instance: usize,
    holders: FxHashMap<u64, FxHashSet<InstanceId>>,
    lru: HashMap<InstanceId, VecDeque<u64>>,
}

impl PrefixAffinityIndex {
    pub fn new(block_size_tokens: usize, capacity_per_instance: usize) -> Self {
        Self {
            block_size_tokens,
            capacity_per_instance,
            holders: FxHashMap::default(),
            lru: HashMap::new(),
        }
    }

    pub fn block_hashes(&self, tokens: &[u32]) -> Vec<u64> {
        let mut hashes = Vec::new();
        let mut parent = None;
        for chunk in tokens.chunks(self.block_size_tokens) {
            if chunk.len() < self.block_size_tokens {
                break;
            }
            let hash = chained_block_hash(parent, chunk);
            hashes.push(hash);
            parent = Some(hash);
        }
        hashes
    }

    /// Observer hook: called after a routing decision records which
    /// instance the request went to and what blocks it will populate.
    pub fn record(&mut self, instance: InstanceId, hashes: &[u64]) {
        for &hash in hashes {
            self.touch(instance, hash);
        }
    }

    fn touch(&mut self, instance: InstanceId, hash: u64) {
        self.holders.entry(hash).or_default().insert(instance);

        let lru = self.lru.entry(instance).or_default();
        if let Some(pos) = lru.iter().position(|&h| h == hash) {
            lru.remove(pos);
        }
        lru.push_back(hash);

        while lru.len() > self.capacity_per_instance {
            let evicted = lru.pop_front().expect("just checked len > 0");
            if let Some(set) = self.holders.get_mut(&evicted) {
                set.remove(&instance);
                if set.is_empty() {
                    self.holders.remove(&evicted);
                }
            }
        }
    }

    pub fn holders_of(&self, hash: u64) -> Option<&FxHashSet<InstanceId>> {
        self.holders.get(&hash)
    }
}

/// Fraction of a request's hashed prefix blocks currently attributed to
/// each instance in the approximate index.
pub struct PrefixAffinityScorer {
    index: Rc<RefCell<PrefixAffinityIndex>>,
}

impl PrefixAffinityScorer {
    pub fn new(index: Rc<RefCell<PrefixAffinityIndex>>) -> Self {
        Self { index }
    }
}

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn score(&mut self, request: &Request, state: &RouterState) -> HashMap<InstanceId, f64> {
        let index = self.index.borrow();
        let hashes = index.block_hashes(&request.input_tokens);
        let mut scores: HashMap<InstanceId, f64> =
            state.snapshots.iter().map(|s| (s.instance_id, 0.0)).collect();

        if hashes.is_empty() {
            return scores;
        }

        for hash in &hashes {
            if let Some(holders) = index.holders_of(*hash) {
                for &instance in holders {
                    *scores.entry(instance).or_insert(0.0) += 1.0 / hashes.len() as f64;
                }
            }
        }
        for v in scores.values_mut() {
            *v = v.clamp(0.0, 1.0);
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestId, SloClass};
    use slotmap::SlotMap;

    fn instance_id() -> InstanceId {
        let mut sm: SlotMap<InstanceId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    fn req(tokens: Vec<u32>) -> Request {
        let mut sm: SlotMap<RequestId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        Request::new(id, 0, tokens, vec![1], "t".to_string(), SloClass::Interactive, 0.0)
    }

    #[test]
    fn prefix_affinity_index_evicts_lru_beyond_capacity() {
        let instance = instance_id();
        let mut index = PrefixAffinityIndex::new(2, 2);
        index.record(instance, &[1, 2, 3]);
        assert!(index.holders_of(1).is_none(), "hash 1 should have been evicted");
        assert!(index.holders_of(2).is_some());
        assert!(index.holders_of(3).is_some());
    }

    #[test]
    fn prefix_affinity_scorer_prefers_instance_with_matching_blocks() {
        let instance_a = instance_id();
        let instance_b = instance_id();
        let index = Rc::new(RefCell::new(PrefixAffinityIndex::new(2, 100)));

        let request = req(vec![10, 20, 30, 40]);
        let hashes = index.borrow().block_hashes(&request.input_tokens);
        index.borrow_mut().record(instance_a, &hashes);

        let mut scorer = PrefixAffinityScorer::new(index);
        let state = RouterState {
            clock: 0,
            snapshots: vec![
                crate::snapshot::Snapshot {
                    instance_id: instance_a,
                    timestamp: 0,
                    queue_depth: 0,
                    batch_size: 0,
                    kv_utilization: 0.0,
                    free_kv_blocks: 0,
                    cache_hit_rate: 0.0,
                    pending_requests: 0,
                },
                crate::snapshot::Snapshot {
                    instance_id: instance_b,
                    timestamp: 0,
                    queue_depth: 0,
                    batch_size: 0,
                    kv_utilization: 0.0,
                    free_kv_blocks: 0,
                    cache_hit_rate: 0.0,
                    pending_requests: 0,
                },
            ],
        };
        let scores = scorer.score(&request, &state);
        assert!(scores[&instance_a] > scores[&instance_b]);
    }

    #[test]
    fn min_max_normalize_handles_equal_values() {
        let id = instance_id();
        let mut values = HashMap::new();
        values.insert(id, 5.0);
        let normalized = min_max_normalize(&values);
        assert_eq!(normalized[&id], 0.0);
    }
}
