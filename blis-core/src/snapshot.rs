//! Point-in-time, immutable views of instance state, used for routing.

use crate::request::InstanceId;
use serde::Serialize;
use std::collections::HashMap;

/// An immutable value. Callers always get a copy — no internal pointers or
/// slices are shared with the source instance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub instance_id: InstanceId,
    pub timestamp: i64,
    pub queue_depth: u32,
    pub batch_size: u32,
    pub kv_utilization: f64,
    pub free_kv_blocks: u32,
    pub cache_hit_rate: f64,
    pub pending_requests: u32,
}

/// A point-in-time vector of `Snapshot` across all instances plus the
/// current clock. Scored, not mutated, by routing.
#[derive(Debug, Clone)]
pub struct RouterState {
    pub clock: i64,
    pub snapshots: Vec<Snapshot>,
}

impl RouterState {
    pub fn get(&self, instance_id: InstanceId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.instance_id == instance_id)
    }
}

/// Which fields may be stale and by how much, per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Refresh on every read — matches legacy always-fresh behavior.
    Immediate,
    /// Refresh when `clock - last_refresh >= interval`.
    Periodic { interval: i64 },
    /// Refresh only on an explicit `refresh_all` call.
    OnDemand,
}

/// Owns a per-instance cached snapshot with a last-refresh timestamp and a
/// refresh mode. `source` is a closure producing a fresh `Snapshot` for the
/// given instance at the given clock; callers supply it so this type has no
/// dependency on `Instance` directly.
pub struct SnapshotProvider {
    mode: RefreshMode,
    cache: HashMap<InstanceId, (Snapshot, i64)>,
}

impl SnapshotProvider {
    pub fn new(mode: RefreshMode) -> Self {
        Self {
            mode,
            cache: HashMap::new(),
        }
    }

    /// Reads the cached snapshot for `instance_id`, refreshing it first if
    /// the mode and clock call for it.
    pub fn read(
        &mut self,
        instance_id: InstanceId,
        clock: i64,
        source: impl FnOnce() -> Snapshot,
    ) -> Snapshot {
        let should_refresh = match self.mode {
            RefreshMode::Immediate => true,
            RefreshMode::Periodic { interval } => match self.cache.get(&instance_id) {
                Some(&(_, last_refresh)) => clock - last_refresh >= interval,
                None => true,
            },
            RefreshMode::OnDemand => !self.cache.contains_key(&instance_id),
        };

        if should_refresh {
            let snapshot = source();
            self.cache.insert(instance_id, (snapshot, clock));
            snapshot
        } else {
            self.cache[&instance_id].0
        }
    }

    /// Forces every cached entry to refresh on its next `read`, regardless
    /// of mode, by invalidating the stored timestamp.
    pub fn refresh_all(&mut self, clock: i64, mut source: impl FnMut(InstanceId) -> Snapshot) {
        let ids: Vec<InstanceId> = self.cache.keys().copied().collect();
        for id in ids {
            let snapshot = source(id);
            self.cache.insert(id, (snapshot, clock));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn instance_id() -> InstanceId {
        let mut sm: SlotMap<InstanceId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    fn snap(id: InstanceId, timestamp: i64, queue_depth: u32) -> Snapshot {
        Snapshot {
            instance_id: id,
            timestamp,
            queue_depth,
            batch_size: 0,
            kv_utilization: 0.0,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            pending_requests: 0,
        }
    }

    #[test]
    fn periodic_mode_is_stale_within_interval_then_fresh() {
        let id = instance_id();
        let mut provider = SnapshotProvider::new(RefreshMode::Periodic { interval: 10 });

        let first = provider.read(id, 0, || snap(id, 0, 1));
        assert_eq!(first.queue_depth, 1);

        let second = provider.read(id, 5, || snap(id, 5, 99));
        assert_eq!(second.queue_depth, 1, "within interval must return cached value");

        let third = provider.read(id, 10, || snap(id, 10, 99));
        assert_eq!(third.queue_depth, 99, "at/after interval must refresh");
    }

    #[test]
    fn immediate_mode_always_refreshes() {
        let id = instance_id();
        let mut provider = SnapshotProvider::new(RefreshMode::Immediate);
        provider.read(id, 0, || snap(id, 0, 1));
        let second = provider.read(id, 1, || snap(id, 1, 2));
        assert_eq!(second.queue_depth, 2);
    }

    #[test]
    fn on_demand_mode_only_refreshes_via_refresh_all() {
        let id = instance_id();
        let mut provider = SnapshotProvider::new(RefreshMode::OnDemand);
        provider.read(id, 0, || snap(id, 0, 1));
        let second = provider.read(id, 100, || snap(id, 100, 2));
        assert_eq!(second.queue_depth, 1, "on-demand must not refresh on plain read");

        provider.refresh_all(200, |_| snap(id, 200, 3));
        let third = provider.read(id, 200, || snap(id, 200, 999));
        assert_eq!(third.queue_depth, 3);
    }
}
