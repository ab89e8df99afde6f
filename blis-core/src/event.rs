//! Event ordering primitives shared by the cluster and instance heaps.
//!
//! `INV-5` (causality): an event's execution may only schedule events with
//! timestamp >= current clock. Both `ClusterSimulator` and `Instance` enforce
//! this at the call site that schedules new events (`debug_assert!`).
//!
//! Cluster-level events carry priority `0..=2` (`ClusterArrival`,
//! `Admission`, `Routing`); instance-level events carry priority `3` and up.
//! Ties are broken, across both kinds of heap, by: cluster before instance;
//! lowest instance index first; cluster priority ascending; then a
//! monotonic sequence id — see `cluster.rs::ClusterSimulator::run`.

use crate::request::{InstanceId, Request, RequestId};
use std::cmp::Ordering;

pub const PRIORITY_CLUSTER_ARRIVAL: u8 = 0;
pub const PRIORITY_ADMISSION: u8 = 1;
pub const PRIORITY_ROUTING: u8 = 2;
pub const PRIORITY_INSTANCE_BASE: u8 = 3;

/// Min-heap ordering key: `(timestamp, priority, seq)`, all ascending.
/// `std::collections::BinaryHeap` is a max-heap, so `Ord` is implemented in
/// reverse of the natural field order (smallest key compares greatest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub timestamp: i64,
    pub priority: u8,
    pub seq: u64,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub enum ClusterEventKind {
    /// A new request arrives at the cluster's admission pipeline.
    Arrival { request: Request },
    /// Admission decision for a previously-arrived request.
    Admission { request_id: RequestId },
    /// Routing decision for an admitted request.
    Routing { request_id: RequestId },
}

#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub key: OrderKey,
    pub kind: ClusterEventKind,
}

impl ClusterEvent {
    pub fn new(timestamp: i64, priority: u8, seq: u64, kind: ClusterEventKind) -> Self {
        debug_assert!(priority <= PRIORITY_ROUTING, "cluster event priority out of range");
        Self {
            key: OrderKey {
                timestamp,
                priority,
                seq,
            },
            kind,
        }
    }
}

impl Ord for ClusterEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for ClusterEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for ClusterEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for ClusterEvent {}

#[derive(Debug, Clone)]
pub enum InstanceEventKind {
    /// A request was routed to this instance and should enter its wait queue.
    InternalArrival { request: Request },
    /// Run one batch step.
    Step,
    /// A request was (re-)enqueued, e.g. after preemption.
    Queued { request_id: RequestId },
    /// A request finished and should leave the instance.
    RequestLeft { request_id: RequestId },
}

#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub instance_id: InstanceId,
    pub key: OrderKey,
    pub kind: InstanceEventKind,
}

impl InstanceEvent {
    pub fn new(
        instance_id: InstanceId,
        timestamp: i64,
        seq: u64,
        kind: InstanceEventKind,
    ) -> Self {
        Self {
            instance_id,
            key: OrderKey {
                timestamp,
                priority: PRIORITY_INSTANCE_BASE,
                seq,
            },
            kind,
        }
    }
}

impl Ord for InstanceEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for InstanceEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstanceEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for InstanceEvent {}
