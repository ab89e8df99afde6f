//! Request stream generation: distributional synthesis (§4.8 Distributional)
//! and CSV replay (§4.8 Replay). Neither submits requests into a
//! [`crate::cluster::ClusterSimulator`] directly — both hand back plain
//! [`GeneratedRequest`] values, and the caller mints `RequestId`s one at a
//! time via `ClusterSimulator::submit_request`, keeping id allocation owned
//! by exactly one place.

mod distributional;
mod replay;

pub use distributional::{ArrivalProcess, ClientSpec, DistributionalWorkload, LengthDistribution, MultiTurnConfig};
pub use replay::replay_csv;

use crate::request::SloClass;

/// One request's worth of generated fields, pre-`RequestId`.
#[derive(Debug, Clone)]
pub struct GeneratedRequest {
    pub arrival_time: i64,
    pub input_tokens: Vec<u32>,
    pub output_tokens: Vec<u32>,
    pub tenant_id: String,
    pub slo_class: SloClass,
    pub priority_hint: f64,
}
