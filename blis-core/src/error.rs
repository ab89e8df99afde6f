//! Crate-level error taxonomy (§7): programming errors panic (never
//! represented here), user/config errors are fatal at the CLI boundary,
//! runtime failures propagate through these types, anomalies never appear
//! here at all — they accumulate into `Metrics` counters instead.

use thiserror::Error;

/// Config/YAML loading failures — fatal at the CLI boundary; the core never
/// prints or exits, it only returns a `Display`-able message for the
/// front-end to report.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse YAML at {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required file: {path}")]
    MissingFile { path: String },
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error(transparent)]
    Policy(#[from] crate::policies::PolicyError),
}

/// Workload generation/replay failures.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("CSV parse error at row {row}: {source}")]
    Csv {
        row: usize,
        #[source]
        source: csv::Error,
    },
    #[error("CSV row {row}, column {column:?}: {reason}")]
    MalformedRow {
        row: usize,
        column: &'static str,
        reason: String,
    },
    #[error("client {client} has non-positive rate {rate}")]
    NonPositiveRate { client: String, rate: f64 },
    #[error("workload spec {field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },
}

/// Latency-model construction failures — missing calibration data is fatal,
/// per §6's "missing files fatal" contract.
#[derive(Debug, Error)]
pub enum LatencyError {
    #[error("MFU table missing for model shape {shape}")]
    MissingMfuTable { shape: String },
    #[error("failed to parse MFU CSV at {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}
