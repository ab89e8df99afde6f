//! Step-time and queueing-time estimation.

mod blackbox;
mod roofline;

pub use blackbox::{Blackbox, BlackboxCoefficients};
pub use roofline::{MfuRow, MfuTable, Roofline, RooflineConfig, load_mfu_csv, load_mfu_csv_at};

use crate::request::Request;

/// A running batch as seen by the latency model: the interface hides the
/// feature set, each implementation derives its own features from this.
#[derive(Debug, Clone, Default)]
pub struct BatchShape {
    pub cache_miss_tokens: u64,
    pub decode_tokens: u64,
    pub prefill_requests: u32,
    pub decode_requests: u32,
    pub max_kv_len: u64,
    pub batch_size: u32,
}

impl BatchShape {
    /// Derives a shape from the requests in a step's running batch. Feature
    /// derivation is commutative (sums, maxes, counts), so deriving it here
    /// from a full snapshot matches any incremental accumulation the caller
    /// might otherwise have done per-request.
    pub fn from_running_batch(requests: &[&Request], cache_miss_tokens: u64) -> Self {
        let mut shape = BatchShape {
            cache_miss_tokens,
            ..Default::default()
        };
        for req in requests {
            shape.batch_size += 1;
            if req.is_prefill_done() {
                shape.decode_requests += 1;
                shape.decode_tokens += 1;
            } else {
                shape.prefill_requests += 1;
            }
            shape.max_kv_len = shape.max_kv_len.max(req.progress_index as u64);
        }
        shape
    }
}

/// Two interchangeable latency model implementations behind one contract.
pub trait LatencyModel {
    fn step_time(&self, batch: &BatchShape) -> i64;
    fn queueing_time(&self, request: &Request) -> i64;
    fn output_token_processing_time(&self) -> i64;
    fn scheduling_processing_time(&self) -> i64;
    fn preemption_processing_time(&self) -> i64;
}
