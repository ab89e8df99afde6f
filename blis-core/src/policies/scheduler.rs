//! Orders the wait queue before `BatchFormation::fill` pulls from its front.

use crate::request::Request;

pub trait BatchScheduler {
    /// Reorders `queue` in place.
    fn order_queue(&self, queue: &mut [Request], clock: i64);
}

/// First-come-first-served: arrival order, stable.
pub struct Fcfs;

impl BatchScheduler for Fcfs {
    fn order_queue(&self, queue: &mut [Request], _clock: i64) {
        queue.sort_by_key(|r| r.arrival_time);
    }
}

/// Highest `priority` first, ties broken by arrival order.
pub struct PriorityFcfs;

impl BatchScheduler for PriorityFcfs {
    fn order_queue(&self, queue: &mut [Request], _clock: i64) {
        queue.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap()
                .then_with(|| a.arrival_time.cmp(&b.arrival_time))
        });
    }
}

/// Shortest-job-first: orders by estimated total token count ascending.
pub struct Sjf;

impl BatchScheduler for Sjf {
    fn order_queue(&self, queue: &mut [Request], _clock: i64) {
        queue.sort_by_key(|r| r.total_tokens());
    }
}

/// Pathological: lowest `priority` first, exercising head-of-line blocking
/// and priority-inversion anomaly scenarios.
pub struct ReverseQueuePriority;

impl BatchScheduler for ReverseQueuePriority {
    fn order_queue(&self, queue: &mut [Request], _clock: i64) {
        queue.sort_by(|a, b| a.priority.partial_cmp(&b.priority).unwrap());
    }
}
