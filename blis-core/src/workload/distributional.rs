//! Synthetic multi-client workload generation (§4.8 Distributional).

use super::GeneratedRequest;
use crate::error::WorkloadError;
use crate::request::SloClass;
use crate::rng::PartitionedRng;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};

/// Ticks per simulated second. The simulator's clock is otherwise unitless;
/// this is the one place duration-in-seconds config values are converted to
/// it, matching the microsecond granularity `TokenBucket`/ITL values already
/// assume elsewhere in the crate.
const TICKS_PER_SEC: f64 = 1_000_000.0;

/// Token ids are otherwise-meaningless identity markers; only equality
/// matters for block-hash prefix sharing. Kept to a modest vocabulary so
/// unrelated requests occasionally collide on a shared prefix block, the
/// way real traffic does.
const VOCAB_SIZE: u32 = 50_000;

#[derive(Debug, Clone, Copy)]
pub enum ArrivalProcess {
    /// Homogeneous Poisson process at a fixed rate.
    Poisson { rate_per_sec: f64 },
    /// A background Poisson process plus periodic bursts of simultaneous
    /// arrivals.
    Bursty {
        rate_per_sec: f64,
        burst_size: u32,
        burst_interval_sec: f64,
    },
    /// A Poisson process whose instantaneous rate follows a sinusoid: peak
    /// traffic during "daytime", trough overnight.
    Diurnal {
        base_rate_per_sec: f64,
        amplitude: f64,
        period_sec: f64,
    },
}

impl ArrivalProcess {
    fn validate(&self, client: &str) -> Result<(), WorkloadError> {
        let rate = match *self {
            ArrivalProcess::Poisson { rate_per_sec } => rate_per_sec,
            ArrivalProcess::Bursty { rate_per_sec, .. } => rate_per_sec,
            ArrivalProcess::Diurnal { base_rate_per_sec, .. } => base_rate_per_sec,
        };
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(WorkloadError::NonPositiveRate {
                client: client.to_string(),
                rate,
            });
        }
        Ok(())
    }

    /// Peak instantaneous rate, used as the proposal rate for thinning a
    /// non-homogeneous process (`Diurnal`) or as the plain rate otherwise.
    fn peak_rate(&self) -> f64 {
        match *self {
            ArrivalProcess::Poisson { rate_per_sec } => rate_per_sec,
            ArrivalProcess::Bursty { rate_per_sec, .. } => rate_per_sec,
            ArrivalProcess::Diurnal { base_rate_per_sec, amplitude, .. } => {
                base_rate_per_sec * (1.0 + amplitude.abs())
            }
        }
    }

    /// Instantaneous rate at time `t_sec`, for the thinning accept/reject
    /// test. Constant for everything but `Diurnal`.
    fn rate_at(&self, t_sec: f64) -> f64 {
        match *self {
            ArrivalProcess::Poisson { rate_per_sec } => rate_per_sec,
            ArrivalProcess::Bursty { rate_per_sec, .. } => rate_per_sec,
            ArrivalProcess::Diurnal { base_rate_per_sec, amplitude, period_sec } => {
                let phase = 2.0 * std::f64::consts::PI * t_sec / period_sec;
                (base_rate_per_sec * (1.0 + amplitude * phase.sin())).max(0.0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LengthDistribution {
    Gaussian { mean: f64, std_dev: f64, min: u32, max: u32 },
    Exponential { mean: f64, min: u32, max: u32 },
}

impl LengthDistribution {
    fn sample(&self, rng: &mut SmallRng) -> u32 {
        let (raw, min, max) = match *self {
            LengthDistribution::Gaussian { mean, std_dev, min, max } => {
                let normal = rand_distr::Normal::new(mean, std_dev.max(f64::EPSILON))
                    .expect("std_dev validated positive by ClientSpec::validate");
                (normal.sample(rng), min, max)
            }
            LengthDistribution::Exponential { mean, min, max } => {
                let exp = Exp::new(1.0 / mean.max(f64::EPSILON)).expect("mean validated positive by ClientSpec::validate");
                (exp.sample(rng), min, max)
            }
        };
        (raw.round().max(0.0) as u32).clamp(min, max)
    }

    fn validate(&self, client: &str) -> Result<(), WorkloadError> {
        let mean = match *self {
            LengthDistribution::Gaussian { mean, .. } => mean,
            LengthDistribution::Exponential { mean, .. } => mean,
        };
        if !mean.is_finite() {
            return Err(WorkloadError::NotFinite {
                field: "length_distribution.mean",
                value: mean,
            });
        }
        let _ = client;
        Ok(())
    }
}

/// Multi-turn reasoning: a session of `rounds` requests spaced
/// `round_interval_sec` apart, each carrying the full prior conversation as
/// its prefill (context growth).
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiTurnConfig {
    pub rounds: u32,
    pub round_interval_sec: f64,
}

#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub name: String,
    /// Share of the workload's aggregate rate this client generates, used
    /// only for documentation/weighting at config-authoring time — the
    /// `arrival` process already carries an absolute rate.
    pub rate_fraction: f64,
    pub arrival: ArrivalProcess,
    pub input_length: LengthDistribution,
    pub output_length: LengthDistribution,
    pub tenant_id: String,
    pub slo_class: SloClass,
    pub priority_hint: f64,
    pub multi_turn: Option<MultiTurnConfig>,
    /// Explicit override; absent, the client draws from the run's
    /// partitioned `"workload:{name}"` stream.
    pub seed: Option<u64>,
}

impl ClientSpec {
    fn validate(&self) -> Result<(), WorkloadError> {
        self.arrival.validate(&self.name)?;
        self.input_length.validate(&self.name)?;
        self.output_length.validate(&self.name)?;
        if !self.rate_fraction.is_finite() || self.rate_fraction < 0.0 {
            return Err(WorkloadError::NotFinite {
                field: "rate_fraction",
                value: self.rate_fraction,
            });
        }
        Ok(())
    }
}

/// A Poisson-split multi-client arrival generator, truncated to
/// `max_requests` only after every client has generated over the *full*
/// horizon — never truncating per-client during generation, which would
/// starve low-rate clients (§4.8's documented original bug).
#[derive(Debug, Clone)]
pub struct DistributionalWorkload {
    pub clients: Vec<ClientSpec>,
    pub max_requests: usize,
}

impl DistributionalWorkload {
    /// Generates the full request stream for `horizon` (in clock ticks).
    /// Each client is capped at a soft ceiling of `2 * max_requests`
    /// generated requests (bounding memory when `horizon` vastly exceeds
    /// what `max_requests` will keep), independent of every other client.
    pub fn generate(&self, horizon: i64, run_seed: u64) -> Result<Vec<GeneratedRequest>, WorkloadError> {
        for client in &self.clients {
            client.validate()?;
        }

        let soft_cap_per_client = self.max_requests.saturating_mul(2);
        let mut partitioned = PartitionedRng::new(run_seed);
        let mut all = Vec::new();

        for client in &self.clients {
            let requests = match client.seed {
                Some(seed) => {
                    let mut rng = SmallRng::seed_from_u64(seed);
                    generate_for_client(client, horizon, soft_cap_per_client, &mut rng)
                }
                None => {
                    let label = format!("workload:{}", client.name);
                    generate_for_client(client, horizon, soft_cap_per_client, partitioned.stream(&label))
                }
            };
            all.extend(requests);
        }

        all.sort_by_key(|r| r.arrival_time);
        all.truncate(self.max_requests);
        Ok(all)
    }
}

fn generate_for_client(
    client: &ClientSpec,
    horizon: i64,
    soft_cap: usize,
    rng: &mut SmallRng,
) -> Vec<GeneratedRequest> {
    let mut out = Vec::new();
    background_arrivals(client, horizon, soft_cap, rng, &mut out);

    if let ArrivalProcess::Bursty { burst_size, burst_interval_sec, .. } = client.arrival {
        burst_arrivals(client, horizon, soft_cap, burst_size, burst_interval_sec, rng, &mut out);
    }

    out
}

/// The always-on component of every arrival process: a (possibly
/// non-homogeneous, via thinning) Poisson stream at `rate_at(t)`.
fn background_arrivals(
    client: &ClientSpec,
    horizon: i64,
    soft_cap: usize,
    rng: &mut SmallRng,
    out: &mut Vec<GeneratedRequest>,
) {
    let mut t_sec = 0.0_f64;
    let peak_rate = client.arrival.peak_rate();
    let proposal = Exp::new(peak_rate).expect("rate validated positive by ClientSpec::validate");

    while out.len() < soft_cap {
        t_sec += proposal.sample(rng);
        let timestamp = (t_sec * TICKS_PER_SEC).round() as i64;
        if timestamp > horizon {
            break;
        }

        // Thinning: always accept for constant-rate processes (rate_at ==
        // peak_rate), accept with probability rate_at/peak_rate otherwise.
        let accept_prob = client.arrival.rate_at(t_sec) / peak_rate;
        if rng.r#gen::<f64>() > accept_prob {
            continue;
        }

        match client.multi_turn {
            Some(multi_turn) => emit_session(client, multi_turn, timestamp, horizon, rng, out),
            None => out.push(emit_single(client, timestamp, rng)),
        }
    }
}

/// Periodic clusters of simultaneous arrivals layered on top of the
/// background stream, every `burst_interval_sec`.
fn burst_arrivals(
    client: &ClientSpec,
    horizon: i64,
    soft_cap: usize,
    burst_size: u32,
    burst_interval_sec: f64,
    rng: &mut SmallRng,
    out: &mut Vec<GeneratedRequest>,
) {
    if burst_interval_sec <= 0.0 {
        return;
    }
    let mut t_sec = burst_interval_sec;
    while (t_sec * TICKS_PER_SEC) as i64 <= horizon && out.len() < soft_cap {
        let timestamp = (t_sec * TICKS_PER_SEC).round() as i64;
        for _ in 0..burst_size {
            if out.len() >= soft_cap {
                break;
            }
            out.push(emit_single(client, timestamp, rng));
        }
        t_sec += burst_interval_sec;
    }
}

fn sample_tokens(n: u32, rng: &mut SmallRng) -> Vec<u32> {
    (0..n).map(|_| rng.gen_range(1..=VOCAB_SIZE)).collect()
}

fn emit_single(client: &ClientSpec, timestamp: i64, rng: &mut SmallRng) -> GeneratedRequest {
    let input_tokens = sample_tokens(client.input_length.sample(rng), rng);
    let output_tokens = sample_tokens(client.output_length.sample(rng), rng);
    GeneratedRequest {
        arrival_time: timestamp,
        input_tokens,
        output_tokens,
        tenant_id: client.tenant_id.clone(),
        slo_class: client.slo_class,
        priority_hint: client.priority_hint,
    }
}

/// Emits every round of one multi-turn conversation. Each round's prefill is
/// the entire prior conversation (context growth) plus a fresh user turn;
/// rounds are spaced `round_interval_sec` apart starting at `first_arrival`.
fn emit_session(
    client: &ClientSpec,
    multi_turn: MultiTurnConfig,
    first_arrival: i64,
    horizon: i64,
    rng: &mut SmallRng,
    out: &mut Vec<GeneratedRequest>,
) {
    let mut context = Vec::new();
    let interval_ticks = (multi_turn.round_interval_sec * TICKS_PER_SEC).round() as i64;

    for round in 0..multi_turn.rounds {
        let arrival_time = first_arrival + interval_ticks * round as i64;
        if arrival_time > horizon {
            break;
        }

        let new_turn = sample_tokens(client.input_length.sample(rng), rng);
        context.extend(new_turn);
        let output_tokens = sample_tokens(client.output_length.sample(rng), rng);

        out.push(GeneratedRequest {
            arrival_time,
            input_tokens: context.clone(),
            output_tokens: output_tokens.clone(),
            tenant_id: client.tenant_id.clone(),
            slo_class: client.slo_class,
            priority_hint: client.priority_hint,
        });

        context.extend(output_tokens);
    }
}
