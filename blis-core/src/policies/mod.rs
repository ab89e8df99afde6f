//! Pluggable decision functions: admission, routing (+ scorers), priority,
//! batch scheduling. Each is a small single-method behavioral contract,
//! selected at construction from a [`PolicyBundle`].

mod admission;
mod priority;
mod routing;
mod scheduler;
mod scorers;

pub use admission::{AdmissionPolicy, AlwaysAdmit, TokenBucket};
pub use priority::{Constant as ConstantPriority, InvertedSlo, PriorityPolicy, ReversePriority, SloBased};
pub use routing::{AlwaysBusiest, LeastLoaded, PrefixAffinityBinary, RoundRobin, RoutingDecision, RoutingPolicy, Weighted};
pub use scheduler::{BatchScheduler, Fcfs, PriorityFcfs, ReverseQueuePriority, Sjf};
pub use scorers::{KvUtilizationScorer, LoadBalanceScorer, PrefixAffinityIndex, PrefixAffinityScorer, QueueDepthScorer, Scorer};

use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown {kind} policy {name:?}, valid names are: {valid:?}")]
    UnknownName {
        kind: &'static str,
        name: String,
        valid: Vec<&'static str>,
    },
    #[error("invalid scorer weight for {name:?}: {reason}")]
    InvalidWeight { name: String, reason: &'static str },
    #[error("malformed weighted routing spec {spec:?}: {reason}")]
    MalformedSpec { spec: String, reason: &'static str },
}

/// All valid policy names, authoritative: every construction-time name
/// lookup in this module goes through these functions so the error message
/// naming "the valid set" can never drift from what's actually implemented.
pub const ADMISSION_POLICY_NAMES: &[&str] = &["always-admit", "token-bucket"];
pub const ROUTING_POLICY_NAMES: &[&str] = &[
    "round-robin",
    "least-loaded",
    "always-busiest",
    "prefix-affinity",
    "weighted",
];
pub const PRIORITY_POLICY_NAMES: &[&str] = &["constant", "slo-based", "inverted-slo", "reverse-priority"];
pub const SCHEDULER_NAMES: &[&str] = &["fcfs", "priority-fcfs", "sjf", "reverse-priority"];
pub const SCORER_NAMES: &[&str] = &["queue-depth", "kv-utilization", "load-balance", "prefix-affinity"];

pub fn make_admission_policy(name: &str) -> Result<Box<dyn AdmissionPolicy>, PolicyError> {
    match name {
        "always-admit" => Ok(Box::new(AlwaysAdmit)),
        "token-bucket" => Ok(Box::new(TokenBucket::new(f64::MAX, f64::MAX))),
        _ => Err(unknown("admission", name, ADMISSION_POLICY_NAMES)),
    }
}

pub fn make_priority_policy(name: &str) -> Result<Box<dyn PriorityPolicy>, PolicyError> {
    match name {
        "constant" => Ok(Box::new(ConstantPriority::default())),
        "slo-based" => Ok(Box::new(SloBased)),
        "inverted-slo" => Ok(Box::new(InvertedSlo)),
        "reverse-priority" => Ok(Box::new(ReversePriority)),
        _ => Err(unknown("priority", name, PRIORITY_POLICY_NAMES)),
    }
}

pub fn make_scheduler(name: &str) -> Result<Box<dyn BatchScheduler>, PolicyError> {
    match name {
        "fcfs" => Ok(Box::new(Fcfs)),
        "priority-fcfs" => Ok(Box::new(PriorityFcfs)),
        "sjf" => Ok(Box::new(Sjf)),
        "reverse-priority" => Ok(Box::new(ReverseQueuePriority)),
        _ => Err(unknown("scheduler", name, SCHEDULER_NAMES)),
    }
}

fn make_scorer(name: &str, prefix_index: &Rc<RefCell<PrefixAffinityIndex>>) -> Result<Box<dyn Scorer>, PolicyError> {
    match name {
        "queue-depth" => Ok(Box::new(QueueDepthScorer)),
        "kv-utilization" => Ok(Box::new(KvUtilizationScorer)),
        "load-balance" => Ok(Box::new(LoadBalanceScorer)),
        "prefix-affinity" => Ok(Box::new(PrefixAffinityScorer::new(Rc::clone(prefix_index)))),
        _ => Err(unknown("scorer", name, SCORER_NAMES)),
    }
}

/// Parses a `"name:weight,name:weight,..."` scorer pipeline spec (the CLI
/// surface for `--routing weighted=<spec>`) into a constructed `Weighted`.
fn parse_weighted_spec(
    spec: &str,
    prefix_index: &Rc<RefCell<PrefixAffinityIndex>>,
) -> Result<Weighted, PolicyError> {
    let mut scorers = Vec::new();
    for term in spec.split(',') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        let (name, weight_str) = term.split_once(':').ok_or(PolicyError::MalformedSpec {
            spec: spec.to_string(),
            reason: "each term must be \"name:weight\"",
        })?;
        let weight: f64 = weight_str.trim().parse().map_err(|_| PolicyError::MalformedSpec {
            spec: spec.to_string(),
            reason: "weight must parse as a floating-point number",
        })?;
        scorers.push((make_scorer(name.trim(), prefix_index)?, weight));
    }
    Weighted::new(scorers)
}

/// Constructs a routing policy by name. `"weighted"` accepts an optional
/// `name:weight,...` suffix after `=`; absent a suffix it equally weights
/// every scorer in [`SCORER_NAMES`]. `"prefix-affinity"` (the plain binary
/// variant) and any weighted spec naming `"prefix-affinity"` share the same
/// `prefix_index`, so observations recorded by one feed the other.
pub fn make_routing_policy(
    name: &str,
    prefix_index: &Rc<RefCell<PrefixAffinityIndex>>,
) -> Result<Box<dyn RoutingPolicy>, PolicyError> {
    if let Some(spec) = name.strip_prefix("weighted=") {
        return Ok(Box::new(parse_weighted_spec(spec, prefix_index)?));
    }
    match name {
        "round-robin" => Ok(Box::new(RoundRobin::default())),
        "least-loaded" => Ok(Box::new(LeastLoaded)),
        "always-busiest" => Ok(Box::new(AlwaysBusiest)),
        "prefix-affinity" => Ok(Box::new(PrefixAffinityBinary::new(PrefixAffinityScorer::new(Rc::clone(
            prefix_index,
        ))))),
        "weighted" => {
            let equal_weight = 1.0;
            let scorers = SCORER_NAMES
                .iter()
                .map(|&n| make_scorer(n, prefix_index).map(|s| (s, equal_weight)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(Weighted::new(scorers)?))
        }
        _ => Err(unknown("routing", name, ROUTING_POLICY_NAMES)),
    }
}

fn unknown(kind: &'static str, name: &str, valid: &[&'static str]) -> PolicyError {
    PolicyError::UnknownName {
        kind,
        name: name.to_string(),
        valid: valid.to_vec(),
    }
}

/// The full set of policies an instance/cluster is constructed with.
///
/// `prefix_index` is kept alongside `routing` (rather than owned privately
/// by it) because the cluster's arrival pipeline must call
/// `prefix_index.borrow_mut().record(...)` after every routing decision,
/// regardless of which routing policy is active.
pub struct PolicyBundle {
    pub admission: Box<dyn AdmissionPolicy>,
    pub routing: Box<dyn RoutingPolicy>,
    pub priority: Box<dyn PriorityPolicy>,
    pub scheduler: Box<dyn BatchScheduler>,
    pub prefix_index: Rc<RefCell<PrefixAffinityIndex>>,
}

impl PolicyBundle {
    pub fn new(
        admission_name: &str,
        routing_name: &str,
        priority_name: &str,
        scheduler_name: &str,
        block_size_tokens: usize,
        prefix_index_capacity_per_instance: usize,
    ) -> Result<Self, PolicyError> {
        let prefix_index = Rc::new(RefCell::new(PrefixAffinityIndex::new(
            block_size_tokens,
            prefix_index_capacity_per_instance,
        )));
        Ok(Self {
            admission: make_admission_policy(admission_name)?,
            routing: make_routing_policy(routing_name, &prefix_index)?,
            priority: make_priority_policy(priority_name)?,
            scheduler: make_scheduler(scheduler_name)?,
            prefix_index,
        })
    }
}
