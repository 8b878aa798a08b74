//! Per-resource exclusive leases.
//!
//! The lock manager is the single source of truth for "who may act on this
//! resource right now". Leases are time-bounded: a crashed worker's lease
//! simply expires, and the next `acquire` takes over. Expiry is passive;
//! nothing scans for dead leases, they are replaced on the next acquire.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockbridge_core::{LockToken, ResourceId};

/// Default lease TTL. Long enough to cover expected external-call latency,
/// short enough to bound the blast radius of a crashed worker.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// A time-bounded exclusive claim on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: ResourceId,
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Grants time-bounded exclusive leases keyed by resource id.
///
/// `acquire` is non-blocking: callers must not wait or poll on contention.
/// The worker pool turns contention into a `Skipped` outcome instead.
pub trait LockManager: Send + Sync {
    /// Try to take the lease. Returns `None` if an unexpired lease exists.
    fn acquire(&self, resource_id: &ResourceId, ttl: Duration) -> Option<Lease>;

    /// Release the lease. Returns `false` if the token does not match the
    /// current holder (e.g. a timed-out owner coming back late).
    fn release(&self, resource_id: &ResourceId, token: LockToken) -> bool;

    /// Push the expiry out by `ttl` from now. Token rules as for `release`.
    fn extend(&self, resource_id: &ResourceId, token: LockToken, ttl: Duration) -> bool;
}

/// In-memory lock table shared by all workers in the process.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: RwLock<HashMap<ResourceId, Lease>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic acquire used by tests.
    pub fn acquire_at(
        &self,
        resource_id: &ResourceId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        let mut leases = self.leases.write().expect("lock table poisoned");
        if let Some(current) = leases.get(resource_id) {
            if !current.is_expired(now) {
                return None;
            }
        }
        let lease = Lease {
            resource_id: resource_id.clone(),
            token: LockToken::new(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        leases.insert(resource_id.clone(), lease.clone());
        Some(lease)
    }

    pub fn release_at(&self, resource_id: &ResourceId, token: LockToken, now: DateTime<Utc>) -> bool {
        let mut leases = self.leases.write().expect("lock table poisoned");
        match leases.get(resource_id) {
            Some(current) if current.token == token && !current.is_expired(now) => {
                leases.remove(resource_id);
                true
            }
            _ => false,
        }
    }

    pub fn extend_at(
        &self,
        resource_id: &ResourceId,
        token: LockToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let mut leases = self.leases.write().expect("lock table poisoned");
        match leases.get_mut(resource_id) {
            Some(current) if current.token == token && !current.is_expired(now) => {
                current.expires_at =
                    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
                true
            }
            _ => false,
        }
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire(&self, resource_id: &ResourceId, ttl: Duration) -> Option<Lease> {
        self.acquire_at(resource_id, ttl, Utc::now())
    }

    fn release(&self, resource_id: &ResourceId, token: LockToken) -> bool {
        self.release_at(resource_id, token, Utc::now())
    }

    fn extend(&self, resource_id: &ResourceId, token: LockToken, ttl: Duration) -> bool {
        self.extend_at(resource_id, token, ttl, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str) -> ResourceId {
        ResourceId::new(id).unwrap()
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_acquire_fails_while_lease_is_live() {
        let locks = InMemoryLockManager::new();
        let now = Utc::now();
        let res = resource("map-1");

        assert!(locks.acquire_at(&res, TTL, now).is_some());
        assert!(locks.acquire_at(&res, TTL, now).is_none());
        // A different resource is unaffected.
        assert!(locks.acquire_at(&resource("map-2"), TTL, now).is_some());
    }

    #[test]
    fn expired_lease_is_replaced_at_expiry_not_before() {
        let locks = InMemoryLockManager::new();
        let now = Utc::now();
        let res = resource("map-1");

        let lease = locks.acquire_at(&res, TTL, now).unwrap();

        let just_before = lease.expires_at - chrono::Duration::milliseconds(1);
        assert!(locks.acquire_at(&res, TTL, just_before).is_none());

        // Owner crashed without releasing; at expires_at the lease is free.
        let replacement = locks.acquire_at(&res, TTL, lease.expires_at).unwrap();
        assert_ne!(replacement.token, lease.token);
    }

    #[test]
    fn release_requires_the_current_token() {
        let locks = InMemoryLockManager::new();
        let now = Utc::now();
        let res = resource("map-1");

        let lease = locks.acquire_at(&res, TTL, now).unwrap();
        assert!(!locks.release_at(&res, LockToken::new(), now));
        assert!(locks.release_at(&res, lease.token, now));
        // Released: next acquire succeeds immediately.
        assert!(locks.acquire_at(&res, TTL, now).is_some());
    }

    #[test]
    fn stale_owner_cannot_release_or_extend() {
        let locks = InMemoryLockManager::new();
        let now = Utc::now();
        let res = resource("map-1");

        let stale = locks.acquire_at(&res, TTL, now).unwrap();
        let after_expiry = stale.expires_at + chrono::Duration::seconds(1);
        let fresh = locks.acquire_at(&res, TTL, after_expiry).unwrap();

        // The timed-out owner comes back late.
        assert!(!locks.release_at(&res, stale.token, after_expiry));
        assert!(!locks.extend_at(&res, stale.token, TTL, after_expiry));

        // The live holder still owns the lease.
        assert!(locks.extend_at(&res, fresh.token, TTL, after_expiry));
    }

    #[test]
    fn extend_pushes_expiry_forward() {
        let locks = InMemoryLockManager::new();
        let now = Utc::now();
        let res = resource("map-1");

        let lease = locks.acquire_at(&res, TTL, now).unwrap();
        let later = now + chrono::Duration::seconds(20);
        assert!(locks.extend_at(&res, lease.token, TTL, later));

        // Still held at the original expiry instant.
        assert!(locks.acquire_at(&res, TTL, lease.expires_at).is_none());
    }

    #[test]
    fn concurrent_acquires_grant_exactly_one_lease() {
        use std::sync::Arc;

        let locks = Arc::new(InMemoryLockManager::new());
        let now = Utc::now();
        let res = resource("map-1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let res = res.clone();
                std::thread::spawn(move || locks.acquire_at(&res, TTL, now).is_some())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1, "exactly one concurrent acquire must win");
    }
}
