//! Blackbox latency model: a linear fit over per-step batch features.

use super::{BatchShape, LatencyModel};
use crate::request::Request;
use serde::{Deserialize, Serialize};

/// Coefficients for one (model, GPU, TP, vLLM version) combination, loaded
/// from a defaults file at startup (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlackboxCoefficients {
    /// `beta0`: fixed per-step overhead.
    pub beta0: f64,
    /// `beta1`: cost per cache-miss (prefill) token.
    pub beta1: f64,
    /// `beta2`: cost per decode token.
    pub beta2: f64,
    /// `alpha0`: fixed queueing overhead.
    pub alpha0: f64,
    /// `alpha1`: queueing cost per input token.
    pub alpha1: f64,
    /// `alpha2`: per-output-token processing time.
    pub alpha2: f64,
    pub scheduling_processing_time: i64,
    pub preemption_processing_time: i64,
}

pub struct Blackbox {
    coefficients: BlackboxCoefficients,
}

impl Blackbox {
    pub fn new(coefficients: BlackboxCoefficients) -> Self {
        Self { coefficients }
    }
}

impl LatencyModel for Blackbox {
    fn step_time(&self, batch: &BatchShape) -> i64 {
        let c = &self.coefficients;
        (c.beta0
            + c.beta1 * batch.cache_miss_tokens as f64
            + c.beta2 * batch.decode_tokens as f64)
            .round() as i64
    }

    fn queueing_time(&self, request: &Request) -> i64 {
        let c = &self.coefficients;
        (c.alpha0 + c.alpha1 * request.input_tokens.len() as f64).round() as i64
    }

    fn output_token_processing_time(&self) -> i64 {
        self.coefficients.alpha2.round() as i64
    }

    fn scheduling_processing_time(&self) -> i64 {
        self.coefficients.scheduling_processing_time
    }

    fn preemption_processing_time(&self) -> i64 {
        self.coefficients.preemption_processing_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestId, SloClass};
    use slotmap::SlotMap;

    fn coefficients() -> BlackboxCoefficients {
        BlackboxCoefficients {
            beta0: 10.0,
            beta1: 2.0,
            beta2: 1.0,
            alpha0: 5.0,
            alpha1: 0.5,
            alpha2: 3.0,
            scheduling_processing_time: 1,
            preemption_processing_time: 2,
        }
    }

    #[test]
    fn step_time_is_linear_in_batch_features() {
        let model = Blackbox::new(coefficients());
        let shape = BatchShape {
            cache_miss_tokens: 100,
            decode_tokens: 8,
            ..Default::default()
        };
        assert_eq!(model.step_time(&shape), 10 + 2 * 100 + 1 * 8);
    }

    #[test]
    fn queueing_time_scales_with_input_length() {
        let model = Blackbox::new(coefficients());
        let mut sm: SlotMap<RequestId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        let req = Request::new(
            id,
            0,
            vec![0; 20],
            vec![0; 5],
            "t".to_string(),
            SloClass::Interactive,
            0.0,
        );
        assert_eq!(model.queueing_time(&req), 5 + (0.5 * 20.0) as i64);
    }
}
