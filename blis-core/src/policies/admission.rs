//! Admission: should a request even enter the cluster?

use crate::request::Request;
use crate::snapshot::RouterState;

/// Rejecting increments a cluster rejection counter; no instance observes
/// the request.
pub trait AdmissionPolicy {
    fn admit(&mut self, request: &Request, snapshots: &RouterState, clock: i64) -> (bool, String);
}

pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _request: &Request, _snapshots: &RouterState, _clock: i64) -> (bool, String) {
        (true, "always-admit".to_string())
    }
}

/// Stateful token-bucket: a request is admitted only while tokens remain;
/// the bucket refills continuously at `rate_per_sec` up to `capacity`.
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    tokens: f64,
    last_refill: i64,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            rate_per_sec,
            tokens: capacity,
            last_refill: 0,
        }
    }

    fn refill(&mut self, clock: i64) {
        let elapsed_secs = (clock - self.last_refill).max(0) as f64 / 1_000_000.0;
        self.tokens = (self.tokens + elapsed_secs * self.rate_per_sec).min(self.capacity);
        self.last_refill = clock;
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, _request: &Request, _snapshots: &RouterState, clock: i64) -> (bool, String) {
        self.refill(clock);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            (true, "token-bucket: admitted".to_string())
        } else {
            (false, "token-bucket: exhausted".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestId, SloClass};
    use slotmap::SlotMap;

    fn req() -> Request {
        let mut sm: SlotMap<RequestId, ()> = SlotMap::with_key();
        let id = sm.insert(());
        Request::new(id, 0, vec![1], vec![1], "t".to_string(), SloClass::Interactive, 0.0)
    }

    #[test]
    fn token_bucket_exhausts_then_refills() {
        let mut bucket = TokenBucket::new(2.0, 1.0);
        let state = RouterState {
            clock: 0,
            snapshots: vec![],
        };
        let r = req();
        assert!(bucket.admit(&r, &state, 0).0);
        assert!(bucket.admit(&r, &state, 0).0);
        assert!(!bucket.admit(&r, &state, 0).0, "bucket should be exhausted");

        // One second later, one token has refilled.
        assert!(bucket.admit(&r, &state, 1_000_000).0);
    }
}
