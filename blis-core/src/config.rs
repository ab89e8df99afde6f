//! YAML-shaped configuration structs (§6): strict parsing
//! (`deny_unknown_fields`), validated independently of construction so a
//! front-end can surface every problem before building a
//! [`crate::cluster::ClusterSimulator`].

use crate::error::ConfigError;
use crate::latency::{BlackboxCoefficients, RooflineConfig};
use crate::policies::{
    ADMISSION_POLICY_NAMES, PRIORITY_POLICY_NAMES, ROUTING_POLICY_NAMES, SCHEDULER_NAMES,
};
use crate::request::SloClass;
use crate::snapshot::RefreshMode;
use crate::workload::{ArrivalProcess, ClientSpec, LengthDistribution, MultiTurnConfig};
use serde::Deserialize;

/// Per-instance engine shape, shared by every instance in the cluster
/// (heterogeneous per-instance configs are a non-goal, per §4.3).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    pub max_running_requests: usize,
    pub max_scheduled_tokens: u64,
    pub long_prefill_token_threshold: usize,
    pub gpu_kv_blocks: usize,
    pub cpu_kv_blocks: usize,
    pub block_size_tokens: usize,
    pub kv_offload_threshold: f64,
    pub kv_offload_latency: i64,
    pub kv_reload_latency: i64,
}

impl InstanceSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("max_running_requests", self.max_running_requests as f64)?;
        require_positive("gpu_kv_blocks", self.gpu_kv_blocks as f64)?;
        require_positive("block_size_tokens", self.block_size_tokens as f64)?;
        if !(0.0..=1.0).contains(&self.kv_offload_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "kv_offload_threshold",
                reason: format!("must be in [0, 1], got {}", self.kv_offload_threshold),
            });
        }
        Ok(())
    }
}

/// Policy names + construction parameters, the YAML counterpart of
/// [`crate::policies::PolicyBundle::new`]'s by-name arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyBundleSpec {
    pub admission: String,
    pub routing: String,
    pub priority: String,
    pub scheduler: String,
    /// Only consulted when `admission == "token-bucket"`.
    #[serde(default)]
    pub token_bucket_capacity: Option<f64>,
    #[serde(default)]
    pub token_bucket_rate_per_sec: Option<f64>,
    pub prefix_index_capacity_per_instance: usize,
}

impl PolicyBundleSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        if !ADMISSION_POLICY_NAMES.contains(&self.admission.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "policies.admission",
                reason: format!("unknown name {:?}, valid names are {ADMISSION_POLICY_NAMES:?}", self.admission),
            });
        }
        if !self.routing.starts_with("weighted=") && !ROUTING_POLICY_NAMES.contains(&self.routing.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "policies.routing",
                reason: format!("unknown name {:?}, valid names are {ROUTING_POLICY_NAMES:?}", self.routing),
            });
        }
        if !PRIORITY_POLICY_NAMES.contains(&self.priority.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "policies.priority",
                reason: format!("unknown name {:?}, valid names are {PRIORITY_POLICY_NAMES:?}", self.priority),
            });
        }
        if !SCHEDULER_NAMES.contains(&self.scheduler.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "policies.scheduler",
                reason: format!("unknown name {:?}, valid names are {SCHEDULER_NAMES:?}", self.scheduler),
            });
        }
        if self.admission == "token-bucket" {
            let capacity = self.token_bucket_capacity.ok_or_else(|| ConfigError::InvalidValue {
                field: "policies.token_bucket_capacity",
                reason: "required when admission = \"token-bucket\"".to_string(),
            })?;
            let rate = self.token_bucket_rate_per_sec.ok_or_else(|| ConfigError::InvalidValue {
                field: "policies.token_bucket_rate_per_sec",
                reason: "required when admission = \"token-bucket\"".to_string(),
            })?;
            require_positive("policies.token_bucket_capacity", capacity)?;
            require_positive("policies.token_bucket_rate_per_sec", rate)?;
        }
        Ok(())
    }
}

/// Which of the two interchangeable latency-model implementations (§4.6) a
/// run uses, and its defaults. `Roofline`'s MFU table is a CSV file on disk
/// (`mfu_csv_path`) rather than an inline field — loading and parsing it is
/// a front-end responsibility via [`crate::latency::load_mfu_csv`]; a
/// missing file is fatal at startup per §7, surfaced as
/// `ConfigError::MissingFile` by the caller that stats the path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, tag = "kind", rename_all = "kebab-case")]
pub enum LatencyDefaults {
    Blackbox { coefficients: BlackboxCoefficients },
    Roofline {
        config: RooflineConfig,
        mfu_csv_path: String,
        scheduling_processing_time: i64,
        preemption_processing_time: i64,
        output_token_processing_time: i64,
        queueing_alpha0: f64,
        queueing_alpha1: f64,
    },
}

impl LatencyDefaults {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LatencyDefaults::Roofline { mfu_csv_path, .. } if mfu_csv_path.trim().is_empty() => {
                Err(ConfigError::InvalidValue {
                    field: "latency.mfu_csv_path",
                    reason: "roofline model requires a non-empty MFU CSV path".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, tag = "kind", rename_all = "kebab-case")]
pub enum ArrivalProcessSpec {
    Poisson { rate_per_sec: f64 },
    Bursty { rate_per_sec: f64, burst_size: u32, burst_interval_sec: f64 },
    Diurnal { base_rate_per_sec: f64, amplitude: f64, period_sec: f64 },
}

impl From<ArrivalProcessSpec> for ArrivalProcess {
    fn from(spec: ArrivalProcessSpec) -> Self {
        match spec {
            ArrivalProcessSpec::Poisson { rate_per_sec } => ArrivalProcess::Poisson { rate_per_sec },
            ArrivalProcessSpec::Bursty { rate_per_sec, burst_size, burst_interval_sec } => {
                ArrivalProcess::Bursty { rate_per_sec, burst_size, burst_interval_sec }
            }
            ArrivalProcessSpec::Diurnal { base_rate_per_sec, amplitude, period_sec } => {
                ArrivalProcess::Diurnal { base_rate_per_sec, amplitude, period_sec }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, tag = "kind", rename_all = "kebab-case")]
pub enum LengthDistributionSpec {
    Gaussian { mean: f64, std_dev: f64, min: u32, max: u32 },
    Exponential { mean: f64, min: u32, max: u32 },
}

impl From<LengthDistributionSpec> for LengthDistribution {
    fn from(spec: LengthDistributionSpec) -> Self {
        match spec {
            LengthDistributionSpec::Gaussian { mean, std_dev, min, max } => {
                LengthDistribution::Gaussian { mean, std_dev, min, max }
            }
            LengthDistributionSpec::Exponential { mean, min, max } => LengthDistribution::Exponential { mean, min, max },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSpecInput {
    pub name: String,
    pub rate_fraction: f64,
    pub arrival: ArrivalProcessSpec,
    pub input_length: LengthDistributionSpec,
    pub output_length: LengthDistributionSpec,
    pub tenant_id: String,
    pub slo_class: SloClass,
    #[serde(default)]
    pub priority_hint: f64,
    #[serde(default)]
    pub multi_turn: Option<MultiTurnConfig>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl From<ClientSpecInput> for ClientSpec {
    fn from(input: ClientSpecInput) -> Self {
        ClientSpec {
            name: input.name,
            rate_fraction: input.rate_fraction,
            arrival: input.arrival.into(),
            input_length: input.input_length.into(),
            output_length: input.output_length.into(),
            tenant_id: input.tenant_id,
            slo_class: input.slo_class,
            priority_hint: input.priority_hint,
            multi_turn: input.multi_turn,
            seed: input.seed,
        }
    }
}

/// A workload is either generated from `clients` or replayed from a CSV file
/// path; exactly one must be present (§4.8's two surfaces are mutually
/// exclusive, never combined in one run).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub clients: Vec<ClientSpecInput>,
    #[serde(default)]
    pub replay_csv_path: Option<String>,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

fn default_max_requests() -> usize {
    usize::MAX
}

impl WorkloadSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.clients.is_empty(), &self.replay_csv_path) {
            (true, None) => Err(ConfigError::InvalidValue {
                field: "workload",
                reason: "must specify either at least one client or replay_csv_path".to_string(),
            }),
            (false, Some(_)) => Err(ConfigError::InvalidValue {
                field: "workload",
                reason: "clients and replay_csv_path are mutually exclusive".to_string(),
            }),
            _ => {
                for client in &self.clients {
                    if !client.rate_fraction.is_finite() || client.rate_fraction < 0.0 {
                        return Err(ConfigError::InvalidValue {
                            field: "workload.clients[].rate_fraction",
                            reason: format!("must be non-negative and finite, got {}", client.rate_fraction),
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// Snapshot staleness policy (§4.4), YAML surface for
/// [`crate::snapshot::RefreshMode`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, tag = "kind", rename_all = "kebab-case")]
pub enum RefreshModeSpec {
    Immediate,
    Periodic { interval: i64 },
    OnDemand,
}

impl From<RefreshModeSpec> for RefreshMode {
    fn from(spec: RefreshModeSpec) -> Self {
        match spec {
            RefreshModeSpec::Immediate => RefreshMode::Immediate,
            RefreshModeSpec::Periodic { interval } => RefreshMode::Periodic { interval },
            RefreshModeSpec::OnDemand => RefreshMode::OnDemand,
        }
    }
}

/// The root of one run's YAML configuration, the single input a front-end
/// parses before constructing a [`crate::cluster::ClusterSimulator`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub seed: u64,
    pub horizon_seconds: f64,
    pub num_instances: usize,
    pub instance: InstanceSpec,
    pub policies: PolicyBundleSpec,
    pub latency: LatencyDefaults,
    pub workload: WorkloadSpec,
    #[serde(default)]
    pub snapshot_refresh: Option<RefreshModeSpec>,
    #[serde(default)]
    pub trace_enabled: bool,
}

impl ClusterConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_yaml::from_str(contents).map_err(|source| ConfigError::Yaml {
            path: "<in-memory>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("num_instances", self.num_instances as f64)?;
        require_positive("horizon_seconds", self.horizon_seconds)?;
        self.instance.validate()?;
        self.policies.validate()?;
        self.latency.validate()?;
        self.workload.validate()?;
        Ok(())
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be a positive finite number, got {value}"),
        });
    }
    Ok(())
}
