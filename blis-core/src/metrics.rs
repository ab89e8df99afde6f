//! Per-instance, mergeable simulation statistics.
//!
//! Statistics are derived from state, never fed back into it — the one
//! documented exception is per-instance `request_rate`, which lives in
//! workload configuration, not here.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    /// Requests that reached this instance via a routing decision.
    pub injected: u64,
    pub completed: u64,
    /// Requests that could never be served (reserved for future admission
    /// paths that drop post-routing; always 0 in the current build).
    pub dropped_unservable: u64,

    pub ttft: Vec<i64>,
    pub e2e: Vec<i64>,
    /// Flattened inter-token latencies across every request this instance
    /// has completed a decode step for.
    pub itl: Vec<i64>,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub kv_allocation_failures: u64,

    time_weighted_kv_usage: f64,
    last_kv_usage_timestamp: Option<i64>,
    pub peak_kv_blocks_used: u32,

    pub priority_inversions: u64,
    pub head_of_line_blocking_events: u64,

    pub sim_ended_time: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn still_queued(&self, wait_queue_len: usize) -> u64 {
        wait_queue_len as u64
    }

    pub fn still_running(&self, running_len: usize) -> u64 {
        running_len as u64
    }

    /// Time-weighted KV usage sample, taken at every step boundary.
    /// `PeakKVBlocksUsed` is a running max over its own prior value — a
    /// statistics-over-statistics accumulation, not a feedback loop into
    /// simulation state.
    pub fn record_kv_usage(&mut self, blocks_used: u32, clock: i64) {
        if let Some(last) = self.last_kv_usage_timestamp {
            let elapsed = (clock - last).max(0) as f64;
            self.time_weighted_kv_usage += elapsed * blocks_used as f64;
        }
        self.last_kv_usage_timestamp = Some(clock);
        self.peak_kv_blocks_used = self.peak_kv_blocks_used.max(blocks_used);
    }

    pub fn time_weighted_kv_usage(&self) -> f64 {
        self.time_weighted_kv_usage
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Cluster-level aggregation: merges maps (no collisions — request ids
    /// are globally unique), concatenates lists, sums counts, maxes
    /// `sim_ended_time`.
    pub fn merge(&self, other: &Metrics) -> Metrics {
        let mut ttft = self.ttft.clone();
        ttft.extend(&other.ttft);
        let mut e2e = self.e2e.clone();
        e2e.extend(&other.e2e);
        let mut itl = self.itl.clone();
        itl.extend(&other.itl);

        Metrics {
            injected: self.injected + other.injected,
            completed: self.completed + other.completed,
            dropped_unservable: self.dropped_unservable + other.dropped_unservable,
            ttft,
            e2e,
            itl,
            cache_hits: self.cache_hits + other.cache_hits,
            cache_misses: self.cache_misses + other.cache_misses,
            kv_allocation_failures: self.kv_allocation_failures + other.kv_allocation_failures,
            time_weighted_kv_usage: self.time_weighted_kv_usage + other.time_weighted_kv_usage,
            last_kv_usage_timestamp: None,
            peak_kv_blocks_used: self.peak_kv_blocks_used.max(other.peak_kv_blocks_used),
            priority_inversions: self.priority_inversions + other.priority_inversions,
            head_of_line_blocking_events: self.head_of_line_blocking_events + other.head_of_line_blocking_events,
            sim_ended_time: self.sim_ended_time.max(other.sim_ended_time),
        }
    }
}

/// Percentile over a list merged across instances, never averaged from
/// per-instance percentiles. `values` need not be pre-sorted.
pub fn percentile(values: &[i64], q: f64) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    assert!((0.0..=1.0).contains(&q), "percentile q must be in [0, 1], got {q}");
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[rank])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counts_and_concatenates_lists() {
        let mut a = Metrics::new();
        a.completed = 3;
        a.ttft = vec![10, 20];
        a.sim_ended_time = 100;

        let mut b = Metrics::new();
        b.completed = 2;
        b.ttft = vec![30];
        b.sim_ended_time = 150;

        let merged = a.merge(&b);
        assert_eq!(merged.completed, 5);
        assert_eq!(merged.ttft, vec![10, 20, 30]);
        assert_eq!(merged.sim_ended_time, 150);
    }

    #[test]
    fn percentile_over_merged_list_not_averaged_percentiles() {
        // Two instances each with one request; p50 over the merged list
        // must not equal the average of two single-element "percentiles".
        let mut a = Metrics::new();
        a.ttft = vec![10];
        let mut b = Metrics::new();
        b.ttft = vec![1000];
        let merged = a.merge(&b);
        let p50 = percentile(&merged.ttft, 0.5).unwrap();
        assert!(p50 == 10 || p50 == 1000, "p50 of a 2-element list is one of the elements");
    }

    #[test]
    fn peak_kv_blocks_used_is_a_running_max() {
        let mut m = Metrics::new();
        m.record_kv_usage(3, 0);
        m.record_kv_usage(1, 10);
        m.record_kv_usage(5, 20);
        assert_eq!(m.peak_kv_blocks_used, 5);
    }

    #[test]
    fn time_weighted_kv_usage_accumulates_by_elapsed_time() {
        let mut m = Metrics::new();
        m.record_kv_usage(2, 0);
        m.record_kv_usage(2, 10);
        assert_eq!(m.time_weighted_kv_usage(), 20.0);
    }
}
