//! Roofline latency model: `time = max(flops / (peak * mfu), bytes / bandwidth)`.

use super::{BatchShape, LatencyModel};
use crate::request::Request;
use serde::{Deserialize, Serialize};

/// One row of a pre-computed MFU (model FLOPs utilization) lookup table,
/// keyed by `(batch_size, kv_len)` for attention. GEMM rows are looked up
/// separately, keyed by `(m, k, n)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfuRow {
    pub batch_size: u32,
    pub kv_len: u64,
    pub mfu: f64,
}

/// Pre-computed MFU lookup, falling back to nearest neighbor (Euclidean
/// distance over the key coordinates) when the exact config is missing.
/// Missing lookup *files* are fatal at startup (§4.6); a missing *row*
/// within a loaded table degrades to nearest neighbor and is logged.
#[derive(Debug, Clone, Default)]
pub struct MfuTable {
    rows: Vec<MfuRow>,
}

impl MfuTable {
    pub fn new(rows: Vec<MfuRow>) -> Self {
        Self { rows }
    }

    pub fn lookup(&self, batch_size: u32, kv_len: u64) -> f64 {
        if let Some(row) = self
            .rows
            .iter()
            .find(|r| r.batch_size == batch_size && r.kv_len == kv_len)
        {
            return row.mfu;
        }

        match self.rows.iter().min_by(|a, b| {
            distance(a, batch_size, kv_len)
                .partial_cmp(&distance(b, batch_size, kv_len))
                .unwrap()
        }) {
            Some(nearest) => {
                tracing::warn!(
                    batch_size,
                    kv_len,
                    nearest_batch_size = nearest.batch_size,
                    nearest_kv_len = nearest.kv_len,
                    "MFU table miss, falling back to nearest neighbor"
                );
                nearest.mfu
            }
            None => 1.0,
        }
    }
}

fn distance(row: &MfuRow, batch_size: u32, kv_len: u64) -> f64 {
    let d_batch = row.batch_size as f64 - batch_size as f64;
    let d_kv = row.kv_len as f64 - kv_len as f64;
    (d_batch * d_batch + d_kv * d_kv).sqrt()
}

/// Hardware + model shape constants a `StepConfig` is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RooflineConfig {
    pub peak_flops_per_sec: f64,
    pub bandwidth_bytes_per_sec: f64,
    pub bytes_per_token: f64,
    pub flops_per_token: f64,
}

pub struct Roofline {
    config: RooflineConfig,
    mfu: MfuTable,
    scheduling_processing_time: i64,
    preemption_processing_time: i64,
    output_token_processing_time: i64,
    queueing_alpha0: f64,
    queueing_alpha1: f64,
}

impl Roofline {
    pub fn new(
        config: RooflineConfig,
        mfu: MfuTable,
        scheduling_processing_time: i64,
        preemption_processing_time: i64,
        output_token_processing_time: i64,
        queueing_alpha0: f64,
        queueing_alpha1: f64,
    ) -> Self {
        Self {
            config,
            mfu,
            scheduling_processing_time,
            preemption_processing_time,
            output_token_processing_time,
            queueing_alpha0,
            queueing_alpha1,
        }
    }

    fn phase_time(&self, tokens: u64, batch_size: u32, kv_len: u64) -> f64 {
        if tokens == 0 {
            return 0.0;
        }
        let mfu = self.mfu.lookup(batch_size, kv_len).clamp(f64::EPSILON, 1.0);
        let flops = tokens as f64 * self.config.flops_per_token;
        let bytes = tokens as f64 * self.config.bytes_per_token;
        let compute_time = flops / (self.config.peak_flops_per_sec * mfu);
        let memory_time = bytes / self.config.bandwidth_bytes_per_sec;
        compute_time.max(memory_time)
    }
}

impl LatencyModel for Roofline {
    fn step_time(&self, batch: &BatchShape) -> i64 {
        let prefill_seconds =
            self.phase_time(batch.cache_miss_tokens, batch.prefill_requests, batch.max_kv_len);
        let decode_seconds =
            self.phase_time(batch.decode_tokens, batch.batch_size, batch.max_kv_len);
        ((prefill_seconds + decode_seconds) * 1_000_000.0).round() as i64
    }

    fn queueing_time(&self, request: &Request) -> i64 {
        (self.queueing_alpha0 + self.queueing_alpha1 * request.input_tokens.len() as f64) as i64
    }

    fn output_token_processing_time(&self) -> i64 {
        self.output_token_processing_time
    }

    fn scheduling_processing_time(&self) -> i64 {
        self.scheduling_processing_time
    }

    fn preemption_processing_time(&self) -> i64 {
        self.preemption_processing_time
    }
}

/// Loads an MFU table from model-shape-keyed CSV rows, per §6 ("MFU tables,
/// CSV, model-shape keyed, missing files fatal").
pub fn load_mfu_csv(contents: &str) -> Result<MfuTable, csv::Error> {
    let mut reader = csv::Reader::from_reader(contents.as_bytes());
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(MfuTable::new(rows))
}

/// Same as [`load_mfu_csv`], with `path` attached to the error for the
/// caller's diagnostic message (missing/malformed MFU files are fatal at
/// startup, per §7).
pub fn load_mfu_csv_at(path: &str, contents: &str) -> Result<MfuTable, crate::error::LatencyError> {
    load_mfu_csv(contents).map_err(|source| crate::error::LatencyError::Csv {
        path: path.to_string(),
        source,
    })
}
