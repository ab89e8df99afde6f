//! CSV replay: `(arrival_time_seconds, model, tenant, prefill_tokens_json,
//! decode_tokens_json)`, RFC-4180. Parse failures carry row/column context;
//! no silent skips (§4.8/§6).

use super::GeneratedRequest;
use crate::error::WorkloadError;
use crate::request::SloClass;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ReplayRow {
    arrival_time_seconds: f64,
    #[allow(dead_code)]
    model: String,
    tenant: String,
    prefill_tokens_json: String,
    decode_tokens_json: String,
}

const TICKS_PER_SEC: f64 = 1_000_000.0;

/// Parses `contents` into a request stream, ordered by the row's own
/// arrival time (the caller is responsible for sorting; real traces are
/// not always emitted in order).
pub fn replay_csv(contents: &str) -> Result<Vec<GeneratedRequest>, WorkloadError> {
    let mut reader = csv::Reader::from_reader(contents.as_bytes());
    let mut out = Vec::new();

    for (idx, record) in reader.deserialize::<ReplayRow>().enumerate() {
        // `csv`'s reader row count excludes the header; +2 gives the
        // 1-indexed line number a user would see in the file.
        let row = idx + 2;
        let row_data = record.map_err(|source| WorkloadError::Csv { row, source })?;

        if !row_data.arrival_time_seconds.is_finite() || row_data.arrival_time_seconds < 0.0 {
            return Err(WorkloadError::MalformedRow {
                row,
                column: "arrival_time_seconds",
                reason: format!("must be a non-negative finite number, got {}", row_data.arrival_time_seconds),
            });
        }
        let prefill_tokens: Vec<u32> =
            serde_json::from_str(&row_data.prefill_tokens_json).map_err(|e| WorkloadError::MalformedRow {
                row,
                column: "prefill_tokens_json",
                reason: e.to_string(),
            })?;
        let decode_tokens: Vec<u32> =
            serde_json::from_str(&row_data.decode_tokens_json).map_err(|e| WorkloadError::MalformedRow {
                row,
                column: "decode_tokens_json",
                reason: e.to_string(),
            })?;

        out.push(GeneratedRequest {
            arrival_time: (row_data.arrival_time_seconds * TICKS_PER_SEC).round() as i64,
            input_tokens: prefill_tokens,
            output_tokens: decode_tokens,
            tenant_id: row_data.tenant,
            slo_class: SloClass::Interactive,
            priority_hint: 0.0,
        });
    }

    Ok(out)
}
