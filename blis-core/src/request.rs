//! Request identity and lifecycle.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a request across its lifetime. Backed by a slotmap key the
    /// same way the teacher's `SubgraphId`/`HandoffId` back onto slotmap keys.
    pub struct RequestId;
}

new_key_type! {
    /// Identifies one of the `N` instances in the cluster.
    pub struct InstanceId;
}

/// `INV-2`: every transition is monotone through the three states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
}

impl RequestState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!((self, next), (Queued, Running) | (Running, Completed))
    }
}

/// Service-level-objective class, used by priority and admission policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloClass {
    Interactive,
    Batch,
    BestEffort,
}

/// Immutable identity plus mutable progress for one inference request.
///
/// Created by the workload generator, injected via the cluster's arrival
/// pipeline, routed to exactly one instance, and destroyed at run end.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub arrival_time: i64,
    pub input_tokens: Vec<u32>,
    pub output_tokens: Vec<u32>,
    pub tenant_id: String,
    pub slo_class: SloClass,
    pub priority_hint: f64,

    pub state: RequestState,
    pub progress_index: usize,
    pub first_token_time: Option<i64>,
    pub itl: Vec<i64>,
    pub scheduled_step_idx: Option<u64>,
    pub finished_step_idx: Option<u64>,
    pub priority: f64,
    /// How many of this request's token positions currently have KV blocks
    /// reserved for them. Distinct from `progress_index` (tokens processed):
    /// a partial block may be reserved ahead of `progress_index` once full,
    /// but never behind it.
    pub kv_allocated_upto: usize,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival_time: i64,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
        tenant_id: String,
        slo_class: SloClass,
        priority_hint: f64,
    ) -> Self {
        Self {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            tenant_id,
            slo_class,
            priority_hint,
            state: RequestState::Queued,
            progress_index: 0,
            first_token_time: None,
            itl: Vec::new(),
            scheduled_step_idx: None,
            finished_step_idx: None,
            priority: 0.0,
            kv_allocated_upto: 0,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.input_tokens.len() + self.output_tokens.len()
    }

    /// The full token sequence (prefill followed by decode) used for KV
    /// block hashing. Decode-token identity matters only for the (rare)
    /// case of two requests sharing an identical continuation; in practice
    /// this just keeps block hashing uniform across prefill and decode.
    pub fn full_tokens(&self) -> Vec<u32> {
        let mut tokens = self.input_tokens.clone();
        tokens.extend(&self.output_tokens);
        tokens
    }

    pub fn is_prefill_done(&self) -> bool {
        self.progress_index >= self.input_tokens.len()
    }

    pub fn is_finished(&self) -> bool {
        self.progress_index >= self.total_tokens()
    }

    /// Moves `self.state` to `next`. Panics (a programming error, §7) if the
    /// transition violates INV-2.
    pub fn transition(&mut self, next: RequestState) {
        assert!(
            self.state.can_transition_to(next),
            "illegal request lifecycle transition: {:?} -> {:?} (request {:?})",
            self.state,
            next,
            self.id
        );
        self.state = next;
    }

    pub fn ttft(&self) -> Option<i64> {
        self.first_token_time.map(|t| t - self.arrival_time)
    }

    pub fn e2e(&self, completed_at: i64) -> i64 {
        completed_at - self.arrival_time
    }
}
