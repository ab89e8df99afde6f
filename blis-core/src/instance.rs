//! Per-instance vLLM-equivalent engine: wait queue, running batch, paged KV
//! cache, and the four-phase `Step`.

use crate::event::{InstanceEvent, InstanceEventKind};
use crate::kv_cache::TieredKvCache;
use crate::kv_cache::KvError;
use crate::latency::{BatchShape, LatencyModel};
use crate::metrics::Metrics;
use crate::policies::{BatchScheduler, PriorityPolicy};
use crate::request::{InstanceId, Request, RequestId, RequestState};
use crate::snapshot::Snapshot;
use std::collections::BinaryHeap;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct InstanceConfig {
    pub max_running_requests: usize,
    pub max_scheduled_tokens: u64,
    pub long_prefill_token_threshold: usize,
}

/// A single `vLLM`-equivalent replica: owns its KV cache, wait queue,
/// running batch, and instance-local event heap. The cluster never writes
/// this state directly (§5); it only enqueues events via `push_event` and
/// reads through the observation methods below.
pub struct Instance {
    id: InstanceId,
    config: InstanceConfig,
    kv: TieredKvCache,
    priority_policy: Box<dyn PriorityPolicy>,
    scheduler: Box<dyn BatchScheduler>,
    latency_model: Box<dyn LatencyModel>,

    wait_queue: Vec<Request>,
    running: Vec<Request>,

    events: BinaryHeap<InstanceEvent>,
    seq: u64,
    clock: i64,
    step_idx: u64,

    metrics: Metrics,
}

impl Instance {
    pub fn new(
        id: InstanceId,
        config: InstanceConfig,
        kv: TieredKvCache,
        priority_policy: Box<dyn PriorityPolicy>,
        scheduler: Box<dyn BatchScheduler>,
        latency_model: Box<dyn LatencyModel>,
    ) -> Self {
        Self {
            id,
            config,
            kv,
            priority_policy,
            scheduler,
            latency_model,
            wait_queue: Vec::new(),
            running: Vec::new(),
            events: BinaryHeap::new(),
            seq: 0,
            clock: 0,
            step_idx: 0,
            metrics: Metrics::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Enqueues `kind` for execution at `timestamp`. `INV-5`: callers must
    /// never schedule into the past relative to the instance's own clock.
    pub fn push_event(&mut self, timestamp: i64, kind: InstanceEventKind) {
        debug_assert!(
            timestamp >= self.clock,
            "instance {:?}: scheduled event at {timestamp} before clock {}",
            self.id,
            self.clock
        );
        let seq = self.next_seq();
        self.events.push(InstanceEvent::new(self.id, timestamp, seq, kind));
    }

    pub fn next_timestamp(&self) -> Option<i64> {
        self.events.peek().map(|e| e.key.timestamp)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pop_event(&mut self) -> Option<InstanceEvent> {
        self.events.pop()
    }

    /// Executes one previously-popped event. `now` is the shared clock's
    /// value at the moment this event was selected; `INV-3` requires it be
    /// `>= self.clock`.
    pub fn execute(&mut self, event: InstanceEvent, now: i64) {
        debug_assert!(now >= self.clock, "instance clock went backwards: {} -> {now}", self.clock);
        self.clock = now;

        match event.kind {
            InstanceEventKind::InternalArrival { request } => self.handle_internal_arrival(request, now),
            InstanceEventKind::Step => self.step(now),
            InstanceEventKind::Queued { request_id } => {
                trace!(instance = ?self.id, request = ?request_id, "request re-queued after preemption");
            }
            InstanceEventKind::RequestLeft { request_id } => {
                trace!(instance = ?self.id, request = ?request_id, "request left the instance");
            }
        }
    }

    fn handle_internal_arrival(&mut self, request: Request, now: i64) {
        self.metrics.injected += 1;
        self.wait_queue.push(request);
        // §4.3 Phase 4 / INV-8: an otherwise-idle instance must not strand
        // newly arrived work until some other event wakes it.
        if !self.has_step_scheduled() {
            self.push_event(now, InstanceEventKind::Step);
        }
    }

    fn has_step_scheduled(&self) -> bool {
        self.events.iter().any(|e| matches!(e.kind, InstanceEventKind::Step))
    }

    /// `Step(now)`: the four-phase heart of the engine (§4.3).
    fn step(&mut self, now: i64) {
        self.step_idx += 1;
        let step_idx = self.step_idx;
        debug!(instance = ?self.id, step_idx, now, "step start");

        let misses_before = self.kv.gpu.cache_misses;
        self.schedule_phase(now, step_idx);
        // `cache_misses` counts blocks, not tokens, and is cumulative for the
        // instance's whole run; the step-time feature needs *this step's*
        // newly-missed prefill tokens, so take the delta opened by
        // `fill_running_batch` (the only allocator called from
        // `schedule_phase`) and scale it back up to tokens.
        let miss_blocks_this_step = self.kv.gpu.cache_misses - misses_before;
        let cache_miss_tokens = miss_blocks_this_step * self.kv.gpu.block_size_tokens() as u64;
        let step_duration = self.execute_phase(now, cache_miss_tokens);
        self.complete_phase(now, step_duration, step_idx);
        self.schedule_next_phase(now, step_duration);

        self.metrics.record_kv_usage(self.kv.gpu.allocated_blocks() as u32, now);
    }

    /// Phase 1 — Schedule.
    fn schedule_phase(&mut self, now: i64, step_idx: u64) {
        for request in &mut self.wait_queue {
            request.priority = self.priority_policy.compute(request, now);
        }
        self.scheduler.order_queue(&mut self.wait_queue, now);
        self.fill_running_batch(now, step_idx);
    }

    /// `BatchFormation.Fill`: moves requests from the front of the (already
    /// ordered) wait queue into the running batch under the configured caps,
    /// admitting only requests whose first prefill block can allocate.
    fn fill_running_batch(&mut self, now: i64, step_idx: u64) {
        let mut scheduled_tokens: u64 = self
            .running
            .iter()
            .map(|r| if r.is_prefill_done() { 1 } else { 0 })
            .sum();
        // Highest `priority` left behind by an allocation failure below;
        // if a later, lower-priority request still gets admitted this
        // pass, that's a priority inversion (§4.5/§7).
        let mut max_skipped_priority: Option<f64> = None;

        let mut i = 0;
        while i < self.wait_queue.len() {
            if self.running.len() >= self.config.max_running_requests {
                break;
            }
            let request = &self.wait_queue[i];
            let remaining_prefill = request.input_tokens.len().saturating_sub(request.progress_index);
            let chunk = remaining_prefill.min(self.config.long_prefill_token_threshold.max(1));
            // A request re-entering the queue after preemption has no KV
            // blocks left (they were released) but has already advanced
            // `progress_index` past its prefill; re-attach covers every full
            // block generated so far in one shot rather than re-chunking it.
            // Rounded down to a block boundary for the same reason
            // `grow_kv_for_decode` rounds down: a block index must never be
            // handed out twice. The trailing partial block (if any) is
            // caught by `complete_phase`'s top-up when the request finishes,
            // or by `grow_kv_for_decode` once decode reaches the next one.
            let start = request.kv_allocated_upto;
            let block_size = self.kv.gpu.block_size_tokens();
            let end = if request.progress_index > request.input_tokens.len() {
                (request.progress_index / block_size) * block_size
            } else {
                (request.progress_index + chunk).min(request.input_tokens.len())
            }
            .max(start);
            let tentative_tokens = scheduled_tokens + (end - start) as u64;
            if tentative_tokens > self.config.max_scheduled_tokens {
                break;
            }

            let full_tokens = request.full_tokens();
            let cached = self.kv.cached_blocks(&full_tokens);
            match self.kv.allocate(request.id, &full_tokens, start, end, &cached) {
                Ok(_blocks) => {
                    if max_skipped_priority.is_some_and(|p| p > request.priority) {
                        self.metrics.priority_inversions += 1;
                    }
                    let mut request = self.wait_queue.remove(i);
                    request.kv_allocated_upto = end;
                    request.transition(RequestState::Running);
                    request.scheduled_step_idx.get_or_insert(step_idx);
                    scheduled_tokens = tentative_tokens;
                    self.running.push(request);
                }
                Err(KvError::OutOfBlocks { .. }) => {
                    self.metrics.kv_allocation_failures += 1;
                    if !self.preempt_one_victim() {
                        // No victim left to preempt; this request stays queued,
                        // so anything admitted after it this pass outranks it.
                        max_skipped_priority =
                            Some(max_skipped_priority.map_or(request.priority, |p| p.max(request.priority)));
                        i += 1;
                    }
                    // Retry the same index on the next loop iteration either
                    // way: a preemption may have freed enough room.
                }
                Err(KvError::NoBlocksForRequest(_)) => unreachable!("allocate never returns this variant"),
            }
        }
        let _ = now;
    }

    /// Preempts the lowest-priority running request to free KV blocks.
    /// Returns `false` if no victim exists (running batch is empty, or
    /// `exclude_idx` was the only candidate).
    fn preempt_one_victim(&mut self) -> bool {
        self.preempt_one_victim_excluding(usize::MAX).is_some()
    }

    /// Same as [`Instance::preempt_one_victim`] but never picks `exclude_idx`
    /// as the victim — used by decode-phase growth, which must not preempt
    /// the very request it's trying to allocate more blocks for. Returns the
    /// removed request's former index in `running`, so callers iterating by
    /// index can tell whether their own cursor needs to shift.
    fn preempt_one_victim_excluding(&mut self, exclude_idx: usize) -> Option<usize> {
        let victim_idx = self
            .running
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != exclude_idx)
            .min_by(|(_, a), (_, b)| a.priority.partial_cmp(&b.priority).unwrap())
            .map(|(i, _)| i)?;

        let mut victim = self.running.remove(victim_idx);
        self.kv.release(victim.id);
        // All blocks released; re-attachment in `fill_running_batch` will
        // re-reserve everything up to its (unchanged) `progress_index`.
        victim.kv_allocated_upto = 0;
        victim.transition(RequestState::Queued);
        self.metrics.head_of_line_blocking_events += 1;
        warn!(instance = ?self.id, request = ?victim.id, "preempting request under KV pressure");
        self.wait_queue.insert(0, victim);
        Some(victim_idx)
    }

    /// Phase 2 — Execute. Returns the step's estimated duration.
    fn execute_phase(&mut self, now: i64, cache_miss_tokens: u64) -> i64 {
        let refs: Vec<&Request> = self.running.iter().collect();
        let shape = BatchShape::from_running_batch(&refs, cache_miss_tokens);
        let base_duration = self.latency_model.step_time(&shape);
        let transfer_latency = self.kv.consume_pending_transfer_latency();
        let step_duration = base_duration + transfer_latency;

        let output_overhead = self.latency_model.output_token_processing_time();

        for request in &mut self.running {
            if !request.is_prefill_done() {
                let remaining = request.input_tokens.len() - request.progress_index;
                let advance = remaining.min(self.config.long_prefill_token_threshold.max(1));
                request.progress_index += advance;
                if request.is_prefill_done() {
                    request.first_token_time = Some(now + step_duration);
                }
            } else if !request.is_finished() {
                request.progress_index += 1;
                let itl = step_duration + output_overhead;
                request.itl.push(itl);
            }
        }

        self.grow_kv_for_decode();
        step_duration
    }

    /// Tops up KV block reservations for requests whose `progress_index`
    /// crossed a full block boundary past `kv_allocated_upto` this step,
    /// preempting other running requests under pressure. Never preempts the
    /// request it's growing blocks for.
    ///
    /// Deliberately only allocates whole blocks: a block index is only ever
    /// handed out once, as either "uncacheable partial" (the final remainder
    /// of a finished request, see `complete_phase`) or a real content-hashed
    /// full block. Growing by a non-block-aligned amount here would ask for
    /// the same block index twice, since the allocator has no notion of
    /// "this index was already given as a partial block."
    fn grow_kv_for_decode(&mut self) {
        let block_size = self.kv.gpu.block_size_tokens();
        let mut idx = 0;
        while idx < self.running.len() {
            let aligned_end = (self.running[idx].progress_index / block_size) * block_size;
            if aligned_end <= self.running[idx].kv_allocated_upto {
                idx += 1;
                continue;
            }
            let request_id = self.running[idx].id;
            let full_tokens = self.running[idx].full_tokens();
            let start = self.running[idx].kv_allocated_upto;
            let end = aligned_end;
            let cached = self.kv.cached_blocks(&full_tokens);
            match self.kv.allocate(request_id, &full_tokens, start, end, &cached) {
                Ok(_blocks) => {
                    self.running[idx].kv_allocated_upto = end;
                    idx += 1;
                }
                Err(KvError::OutOfBlocks { .. }) => {
                    self.metrics.kv_allocation_failures += 1;
                    match self.preempt_one_victim_excluding(idx) {
                        Some(victim_idx) if victim_idx < idx => idx -= 1,
                        Some(_) => {}
                        None => idx += 1,
                    }
                }
                Err(KvError::NoBlocksForRequest(_)) => unreachable!("allocate never returns this variant"),
            }
        }
    }

    /// Phase 3 — Complete. A second pass, deliberately separate from
    /// `execute_phase`: a zero-output-token request satisfies "prefill
    /// done" and "request done" in the same step, and TTFT must be
    /// recorded (phase 2) before E2E is computed (this phase).
    fn complete_phase(&mut self, now: i64, step_duration: i64, step_idx: u64) {
        let completed_at = now + step_duration;
        let mut still_running = Vec::with_capacity(self.running.len());

        for mut request in self.running.drain(..) {
            if request.is_finished() {
                // A zero-output-token request can reach `is_finished()`
                // without ever passing through `grow_kv_for_decode` (its
                // prefill finished and there was no decode step at all), so
                // its final block may still be unreserved here. Covers that
                // gap before release; a no-op for any request already caught
                // up by decode-phase growth.
                if request.progress_index > request.kv_allocated_upto {
                    let full_tokens = request.full_tokens();
                    let cached = self.kv.cached_blocks(&full_tokens);
                    let _ = self.kv.allocate(
                        request.id,
                        &full_tokens,
                        request.kv_allocated_upto,
                        request.progress_index,
                        &cached,
                    );
                    request.kv_allocated_upto = request.progress_index;
                }
                self.kv.release(request.id);

                request.transition(RequestState::Completed);
                request.finished_step_idx = Some(step_idx);
                self.metrics.completed += 1;
                if let Some(ttft) = request.ttft() {
                    self.metrics.ttft.push(ttft);
                }
                self.metrics.e2e.push(request.e2e(completed_at));
                self.metrics.itl.extend(&request.itl);
                self.metrics.cache_hits = self.kv.gpu.cache_hits;
                self.metrics.cache_misses = self.kv.gpu.cache_misses;

                self.push_event(completed_at, InstanceEventKind::RequestLeft { request_id: request.id });
            } else {
                still_running.push(request);
            }
        }

        self.running = still_running;
    }

    /// Phase 4 — Schedule next step. `INV-8`: never leave work waiting with
    /// an idle instance.
    fn schedule_next_phase(&mut self, now: i64, step_duration: i64) {
        let next_at = now + step_duration.max(1);
        if !self.running.is_empty() || !self.wait_queue.is_empty() {
            self.push_event(next_at, InstanceEventKind::Step);
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.wait_queue.len() as u32
    }

    pub fn batch_size(&self) -> u32 {
        self.running.len() as u32
    }

    pub fn kv_utilization(&self) -> f64 {
        self.kv.gpu.utilization()
    }

    pub fn free_kv_blocks(&self) -> u32 {
        self.kv.gpu.free_blocks() as u32
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.kv.gpu.cache_hits + self.kv.gpu.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.kv.gpu.cache_hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self, timestamp: i64) -> Snapshot {
        Snapshot {
            instance_id: self.id,
            timestamp,
            queue_depth: self.queue_depth(),
            batch_size: self.batch_size(),
            kv_utilization: self.kv_utilization(),
            free_kv_blocks: self.free_kv_blocks(),
            cache_hit_rate: self.cache_hit_rate(),
            // `ClusterSimulator::router_state` overwrites this with its
            // live routed-but-not-arrived count; an instance has no way to
            // know that on its own.
            pending_requests: 0,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn wait_queue_len(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Called at finalize: stamps `sim_ended_time` and the still-running /
    /// still-queued counts, used to check `INV-1` conservation.
    pub fn finalize(&mut self, horizon: i64) {
        let ended_at = self.clock.min(horizon);
        self.metrics.sim_ended_time = ended_at;
    }

    pub fn still_queued(&self) -> u64 {
        self.wait_queue.len() as u64
    }

    pub fn still_running(&self) -> u64 {
        self.running.len() as u64
    }

    /// Exposed for the cluster's prefix-affinity observer hook: which
    /// cache-block hashes this request's prefix touches once routed here.
    pub fn block_size_tokens(&self) -> usize {
        self.kv.gpu.block_size_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InstanceEventKind;
    use crate::kv_cache::TieredKvCache;
    use crate::latency::{Blackbox, BlackboxCoefficients};
    use crate::policies::{Fcfs, SloBased};
    use crate::request::{RequestId, SloClass};
    use slotmap::SlotMap;

    fn instance() -> (Instance, InstanceId) {
        let mut sm: SlotMap<InstanceId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        let kv = TieredKvCache::new(8, 0, 2, 0.9, 0, 0);
        let latency = Box::new(Blackbox::new(BlackboxCoefficients {
            beta0: 10.0,
            beta1: 1.0,
            beta2: 1.0,
            alpha0: 0.0,
            alpha1: 0.0,
            alpha2: 1.0,
            scheduling_processing_time: 0,
            preemption_processing_time: 0,
        }));
        let config = InstanceConfig {
            max_running_requests: 4,
            max_scheduled_tokens: 64,
            long_prefill_token_threshold: 4,
        };
        let instance = Instance::new(id, config, kv, Box::new(SloBased), Box::new(Fcfs), latency);
        (instance, id)
    }

    fn req(tokens_in: usize, tokens_out: usize) -> Request {
        let mut sm: SlotMap<RequestId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        Request::new(
            id,
            0,
            vec![1; tokens_in],
            vec![1; tokens_out],
            "tenant".to_string(),
            SloClass::Interactive,
            0.0,
        )
    }

    #[test]
    fn arrival_schedules_a_step_for_an_idle_instance() {
        let (mut instance, _id) = instance();
        assert!(!instance.has_pending_events());
        instance.push_event(0, InstanceEventKind::InternalArrival { request: req(2, 2) });
        let event = instance.pop_event().unwrap();
        instance.execute(event, 0);
        assert!(instance.has_pending_events(), "INV-8: a step must be scheduled for waiting work");
    }

    #[test]
    fn request_runs_to_completion_end_to_end() {
        let (mut instance, _id) = instance();
        instance.push_event(0, InstanceEventKind::InternalArrival { request: req(2, 2) });

        let mut completed = false;
        let mut now = 0;
        for _ in 0..50 {
            let Some(event) = instance.pop_event() else { break };
            now = event.key.timestamp;
            instance.execute(event, now);
            if instance.metrics().completed > 0 {
                completed = true;
                break;
            }
        }
        assert!(completed, "request should complete within a bounded number of steps");
        assert_eq!(instance.metrics().ttft.len(), 1);
        assert_eq!(instance.metrics().e2e.len(), 1);
        assert!(instance.metrics().ttft[0] <= instance.metrics().e2e[0]);
    }

    #[test]
    fn zero_output_tokens_records_ttft_before_e2e_same_step() {
        let (mut instance, _id) = instance();
        instance.push_event(0, InstanceEventKind::InternalArrival { request: req(2, 0) });

        loop {
            let Some(event) = instance.pop_event() else { break };
            let now = event.key.timestamp;
            instance.execute(event, now);
            if instance.metrics().completed > 0 {
                break;
            }
        }
        assert_eq!(instance.metrics().completed, 1);
        assert_eq!(instance.metrics().ttft.len(), 1);
        assert_eq!(instance.metrics().e2e.len(), 1);
    }

    #[test]
    fn preemption_lets_all_requests_eventually_complete_under_memory_pressure() {
        let mut sm: SlotMap<InstanceId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        // Only 2 blocks of size 2 tokens (4 tokens total capacity): forces
        // preemption when multiple 4-token requests compete.
        let kv = TieredKvCache::new(2, 0, 2, 0.99, 0, 0);
        let latency = Box::new(Blackbox::new(BlackboxCoefficients {
            beta0: 5.0,
            beta1: 1.0,
            beta2: 1.0,
            alpha0: 0.0,
            alpha1: 0.0,
            alpha2: 1.0,
            scheduling_processing_time: 0,
            preemption_processing_time: 0,
        }));
        let config = InstanceConfig {
            max_running_requests: 4,
            max_scheduled_tokens: 64,
            long_prefill_token_threshold: 4,
        };
        let mut instance = Instance::new(id, config, kv, Box::new(SloBased), Box::new(Fcfs), latency);

        for _ in 0..3 {
            instance.push_event(0, InstanceEventKind::InternalArrival { request: req(4, 1) });
        }

        let mut iterations = 0;
        while instance.metrics().completed < 3 && iterations < 10_000 {
            let Some(event) = instance.pop_event() else { break };
            let now = event.key.timestamp;
            instance.execute(event, now);
            iterations += 1;
        }

        assert_eq!(instance.metrics().completed, 3, "all requests must eventually complete under preemption");
    }
}
