//! The cluster orchestrator: shared-clock event loop across the cluster's
//! own admission/routing pipeline and every instance's internal heap (§5 —
//! the cluster never writes instance state directly, only enqueues events
//! through `Instance::push_event`).

use crate::event::{
    ClusterEvent, ClusterEventKind, PRIORITY_ADMISSION, PRIORITY_CLUSTER_ARRIVAL, PRIORITY_ROUTING,
};
use crate::instance::{Instance, InstanceConfig};
use crate::kv_cache::TieredKvCache;
use crate::latency::LatencyModel;
use crate::metrics::Metrics;
use crate::policies::{BatchScheduler, PolicyBundle, PriorityPolicy};
use crate::request::{InstanceId, Request, RequestId, SloClass};
use crate::snapshot::{RouterState, SnapshotProvider};
use crate::trace::{RoutingDecisionRecord, Trace, TraceSummary};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use std::collections::BinaryHeap;
use tracing::debug;

/// How many of a routing decision's scored candidates to keep in `Trace`.
const TRACE_TOP_K: usize = 5;

/// Aggregated results of a finished run: merged per-instance `Metrics` plus
/// cluster-owned counters that have no per-instance home.
#[derive(Debug, Clone)]
pub struct ClusterResults {
    pub metrics: Metrics,
    /// Requests rejected by `AdmissionPolicy` before ever reaching an
    /// instance — distinct from `Metrics::dropped_unservable`, which is a
    /// per-instance, post-routing counter.
    pub admission_rejections: u64,
    pub trace_summary: Option<TraceSummary>,
}

/// Owns every instance, the cluster-level event heap, and the shared clock.
/// `instance_order` fixes the "lowest instance index first" tie-break from
/// §4.2 — insertion order, not the arbitrary order a `SlotMap` iterates in.
pub struct ClusterSimulator {
    instances: SlotMap<InstanceId, Instance>,
    instance_order: Vec<InstanceId>,

    request_ids: SlotMap<RequestId, ()>,
    cluster_events: BinaryHeap<ClusterEvent>,
    /// Requests between `Arrival` and a successful `Routing` dispatch.
    pending: FxHashMap<RequestId, Request>,
    /// Per-instance count of requests routed but whose `InternalArrival`
    /// hasn't executed yet (§4.5.1's Tier 1 `pending_requests` signal).
    /// Cluster events at a shared timestamp always pop before instance
    /// events, so this is the only way a second routing decision at the
    /// same `now` can see a request just sent to an instance.
    routed_not_yet_arrived: FxHashMap<InstanceId, u32>,

    seq: u64,
    clock: i64,

    policies: PolicyBundle,
    snapshot_provider: SnapshotProvider,
    trace: Trace,

    admission_rejections: u64,
}

impl ClusterSimulator {
    pub fn new(policies: PolicyBundle, snapshot_provider: SnapshotProvider, trace: Trace) -> Self {
        Self {
            instances: SlotMap::with_key(),
            instance_order: Vec::new(),
            request_ids: SlotMap::with_key(),
            cluster_events: BinaryHeap::new(),
            pending: FxHashMap::default(),
            routed_not_yet_arrived: FxHashMap::default(),
            seq: 0,
            clock: 0,
            policies,
            snapshot_provider,
            trace,
            admission_rejections: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Adds one replica to the cluster, minting its `InstanceId` in the same
    /// call that constructs it (the id is needed by `Instance::new` itself).
    pub fn add_instance(
        &mut self,
        config: InstanceConfig,
        kv: TieredKvCache,
        priority_policy: Box<dyn PriorityPolicy>,
        scheduler: Box<dyn BatchScheduler>,
        latency_model: Box<dyn LatencyModel>,
    ) -> InstanceId {
        let id = self
            .instances
            .insert_with_key(|id| Instance::new(id, config, kv, priority_policy, scheduler, latency_model));
        self.instance_order.push(id);
        id
    }

    pub fn instance_ids(&self) -> &[InstanceId] {
        &self.instance_order
    }

    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id]
    }

    /// Convenience wrapper over [`ClusterSimulator::submit_request`] for a
    /// workload-generated request (`crate::workload::GeneratedRequest`
    /// carries every field but the `RequestId`, which is minted here).
    pub fn submit_generated(&mut self, request: crate::workload::GeneratedRequest) -> RequestId {
        self.submit_request(
            request.arrival_time,
            request.input_tokens,
            request.output_tokens,
            request.tenant_id,
            request.slo_class,
            request.priority_hint,
        )
    }

    /// Mints a `RequestId` and schedules its `Arrival` at `arrival_time`.
    /// `INV-5`: a workload generator must not submit into the cluster's
    /// past.
    pub fn submit_request(
        &mut self,
        arrival_time: i64,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
        tenant_id: String,
        slo_class: SloClass,
        priority_hint: f64,
    ) -> RequestId {
        debug_assert!(
            arrival_time >= self.clock,
            "submitted arrival at {arrival_time} before cluster clock {}",
            self.clock
        );
        let id = self.request_ids.insert(());
        let request = Request::new(id, arrival_time, input_tokens, output_tokens, tenant_id, slo_class, priority_hint);
        let seq = self.next_seq();
        self.cluster_events.push(ClusterEvent::new(
            arrival_time,
            PRIORITY_CLUSTER_ARRIVAL,
            seq,
            ClusterEventKind::Arrival { request },
        ));
        id
    }

    /// A fresh `RouterState` over every instance, through the configured
    /// `SnapshotProvider` (so refresh staleness, §4.7, is honored here too).
    fn router_state(&mut self) -> RouterState {
        let clock = self.clock;
        let mut snapshots = Vec::with_capacity(self.instance_order.len());
        for &id in &self.instance_order {
            let instance = &self.instances[id];
            let mut snapshot = self.snapshot_provider.read(id, clock, || instance.snapshot(clock));
            // Tier 1: always fresh, never drawn from the (possibly stale)
            // cached snapshot, so it keeps compensating for Tier 2 staleness
            // even under `Periodic`/`OnDemand` refresh modes.
            snapshot.pending_requests = self.routed_not_yet_arrived.get(&id).copied().unwrap_or(0);
            snapshots.push(snapshot);
        }
        RouterState { clock, snapshots }
    }

    fn handle_cluster_event(&mut self, event: ClusterEvent) {
        let now = event.key.timestamp;
        match event.kind {
            ClusterEventKind::Arrival { request } => {
                let request_id = request.id;
                self.pending.insert(request_id, request);
                let seq = self.next_seq();
                self.cluster_events.push(ClusterEvent::new(
                    now,
                    PRIORITY_ADMISSION,
                    seq,
                    ClusterEventKind::Admission { request_id },
                ));
            }
            ClusterEventKind::Admission { request_id } => {
                let state = self.router_state();
                let Some(request) = self.pending.get(&request_id) else {
                    return;
                };
                let (admitted, reason) = self.policies.admission.admit(request, &state, now);
                if admitted {
                    let seq = self.next_seq();
                    self.cluster_events.push(ClusterEvent::new(
                        now,
                        PRIORITY_ROUTING,
                        seq,
                        ClusterEventKind::Routing { request_id },
                    ));
                } else {
                    self.pending.remove(&request_id);
                    self.admission_rejections += 1;
                    debug!(request = ?request_id, reason, "request rejected at admission");
                }
            }
            ClusterEventKind::Routing { request_id } => {
                let state = self.router_state();
                let Some(request) = self.pending.remove(&request_id) else {
                    return;
                };
                let decision = self
                    .policies
                    .routing
                    .route(&request, &state)
                    .expect("routing policy returned None with at least one instance in the cluster");
                let instance_id = decision.instance_id;

                // §4.5.1: the observer hook fires after the decision is made,
                // recording the blocks this request will populate.
                let hashes = self.policies.prefix_index.borrow().block_hashes(&request.full_tokens());
                self.policies.prefix_index.borrow_mut().record(instance_id, &hashes);

                if self.trace.is_enabled() {
                    self.trace.record(RoutingDecisionRecord::new(
                        request_id,
                        now,
                        instance_id,
                        decision.scorer_scores.clone(),
                        TRACE_TOP_K,
                    ));
                }

                let instance = self.instances.get_mut(instance_id).expect("routed to a known instance");
                instance.push_event(now, crate::event::InstanceEventKind::InternalArrival { request });
                *self.routed_not_yet_arrived.entry(instance_id).or_insert(0) += 1;
            }
        }
    }

    /// Picks the earliest next event across the cluster heap and every
    /// instance heap, applying §4.2's tie-break: cluster events before
    /// instance events; among instance events, lowest instance index first
    /// (ties within one heap are already resolved by its own `Ord`).
    fn next_timestamp(&self) -> Option<(bool, usize, i64)> {
        let cluster_ts = self.cluster_events.peek().map(|e| e.key.timestamp);

        let mut instance_candidate: Option<(usize, i64)> = None;
        for (idx, &id) in self.instance_order.iter().enumerate() {
            if let Some(ts) = self.instances[id].next_timestamp() {
                let better = match instance_candidate {
                    Some((_, best_ts)) => ts < best_ts,
                    None => true,
                };
                if better {
                    instance_candidate = Some((idx, ts));
                }
            }
        }

        match (cluster_ts, instance_candidate) {
            (None, None) => None,
            (Some(c), None) => Some((true, 0, c)),
            (None, Some((idx, t))) => Some((false, idx, t)),
            (Some(c), Some((idx, t))) => {
                if c <= t {
                    Some((true, 0, c))
                } else {
                    Some((false, idx, t))
                }
            }
        }
    }

    /// Runs until both the cluster and every instance's heap are empty, or
    /// the clock would cross `horizon` — per §8, the event that crosses the
    /// boundary still executes (its timestamp is recorded as the new clock
    /// value and the event runs to completion); nothing after it does.
    pub fn run(&mut self, horizon: i64) {
        loop {
            let Some((is_cluster, instance_idx, timestamp)) = self.next_timestamp() else {
                break;
            };
            self.clock = timestamp;

            if is_cluster {
                let event = self.cluster_events.pop().expect("next_timestamp just confirmed a cluster event");
                self.handle_cluster_event(event);
            } else {
                let id = self.instance_order[instance_idx];
                let instance = self.instances.get_mut(id).expect("instance_order only ever names live instances");
                let event = instance.pop_event().expect("next_timestamp just confirmed this instance has an event");
                if matches!(event.kind, crate::event::InstanceEventKind::InternalArrival { .. }) {
                    if let Some(count) = self.routed_not_yet_arrived.get_mut(&id) {
                        *count = count.saturating_sub(1);
                    }
                }
                instance.execute(event, timestamp);
            }

            if timestamp > horizon {
                break;
            }
        }
    }

    /// Finalizes every instance (stamping `sim_ended_time`) and merges their
    /// metrics, alongside cluster-owned counters.
    pub fn finalize(&mut self, horizon: i64) -> ClusterResults {
        let mut merged = Metrics::new();
        for &id in &self.instance_order {
            let instance = self.instances.get_mut(id).expect("instance_order only ever names live instances");
            instance.finalize(horizon);
            merged = merged.merge(instance.metrics());
        }

        ClusterResults {
            metrics: merged,
            admission_rejections: self.admission_rejections,
            trace_summary: self.trace.is_enabled().then(|| self.trace.summarize()),
        }
    }

    pub fn clock(&self) -> i64 {
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::{Blackbox, BlackboxCoefficients};

    fn flat_latency() -> Box<dyn LatencyModel> {
        Box::new(Blackbox::new(BlackboxCoefficients {
            beta0: 5.0,
            beta1: 1.0,
            beta2: 1.0,
            alpha0: 0.0,
            alpha1: 0.0,
            alpha2: 1.0,
            scheduling_processing_time: 0,
            preemption_processing_time: 0,
        }))
    }

    fn instance_config() -> InstanceConfig {
        InstanceConfig {
            max_running_requests: 4,
            max_scheduled_tokens: 64,
            long_prefill_token_threshold: 4,
        }
    }

    fn cluster(n_instances: usize) -> ClusterSimulator {
        let policies = PolicyBundle::new("always-admit", "round-robin", "slo-based", "fcfs", 16, 64).unwrap();
        let mut sim = ClusterSimulator::new(policies, SnapshotProvider::new(crate::snapshot::RefreshMode::Immediate), Trace::new(true));
        for _ in 0..n_instances {
            let kv = TieredKvCache::new(64, 0, 16, 0.9, 0, 0);
            sim.add_instance(instance_config(), kv, Box::new(crate::policies::SloBased), Box::new(crate::policies::Fcfs), flat_latency());
        }
        sim
    }

    #[test]
    fn single_request_is_admitted_routed_and_completed() {
        let mut sim = cluster(1);
        sim.submit_request(0, vec![1, 2, 3], vec![1, 2], "tenant-a".to_string(), SloClass::Interactive, 0.0);
        sim.run(10_000);
        let results = sim.finalize(10_000);
        assert_eq!(results.metrics.completed, 1);
        assert_eq!(results.admission_rejections, 0);
    }

    #[test]
    fn round_robin_spreads_requests_evenly_across_instances() {
        let mut sim = cluster(4);
        for i in 0..100 {
            sim.submit_request(0, vec![1, 2], vec![1], "tenant-a".to_string(), SloClass::Interactive, i as f64);
        }
        sim.run(1_000_000);
        let results = sim.finalize(1_000_000);
        assert_eq!(results.metrics.completed, 100);

        for &id in sim.instance_ids() {
            assert_eq!(sim.instance(id).metrics().injected, 25, "round-robin over 4 instances must be exactly even");
        }
    }

    #[test]
    fn admission_rejection_never_reaches_an_instance() {
        // `make_admission_policy`'s "token-bucket" wiring is unbounded
        // (`f64::MAX`); build an always-empty bucket directly to force a
        // rejection.
        let policies = PolicyBundle {
            admission: Box::new(crate::policies::TokenBucket::new(0.0, 0.0)),
            ..PolicyBundle::new("always-admit", "round-robin", "slo-based", "fcfs", 16, 64).unwrap()
        };
        let mut sim = ClusterSimulator::new(policies, SnapshotProvider::new(crate::snapshot::RefreshMode::Immediate), Trace::new(false));
        sim.add_instance(
            instance_config(),
            TieredKvCache::new(64, 0, 16, 0.9, 0, 0),
            Box::new(crate::policies::SloBased),
            Box::new(crate::policies::Fcfs),
            flat_latency(),
        );

        sim.submit_request(0, vec![1, 2], vec![1], "tenant-a".to_string(), SloClass::Interactive, 0.0);
        sim.run(1_000);
        let results = sim.finalize(1_000);
        assert_eq!(results.admission_rejections, 1);
        assert_eq!(results.metrics.injected, 0);
        assert_eq!(results.metrics.completed, 0);
    }

    #[test]
    fn trace_records_a_decision_for_every_routed_request() {
        let mut sim = cluster(2);
        sim.submit_request(0, vec![1, 2], vec![1], "tenant-a".to_string(), SloClass::Interactive, 0.0);
        sim.submit_request(0, vec![1, 2], vec![1], "tenant-b".to_string(), SloClass::Interactive, 0.0);
        sim.run(1_000_000);
        let results = sim.finalize(1_000_000);
        let summary = results.trace_summary.expect("trace was enabled");
        assert_eq!(summary.decisions, 2);
    }
}
