//! Leases on allocated slot names.
//!
//! A name returned by `allocate` is still free in the cluster until it is
//! launched. The lease keeps it out of later selections until it is
//! launched, relinquished or the lease expires.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use poolkeeper_id::LeaseId;
use tracing::debug;

/// A claim on one slot name.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub slot_name: String,
    pub granted_at: DateTime<Utc>,
    expires_at: Instant,
}

impl Lease {
    /// Whether the lease no longer shields its name.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Table of live leases, keyed by slot name.
pub struct LeaseTable {
    ttl: Duration,
    leases: Mutex<BTreeMap<String, Lease>>,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            leases: Mutex::new(BTreeMap::new()),
        }
    }

    /// Lease time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lease a batch of names under one id. Existing leases on the same
    /// names are replaced.
    pub fn grant(&self, names: &[String]) -> LeaseId {
        let id = LeaseId::new();
        let granted_at = Utc::now();
        let expires_at = Instant::now() + self.ttl;

        let mut leases = self.lock();
        for name in names {
            leases.insert(
                name.clone(),
                Lease {
                    id,
                    slot_name: name.clone(),
                    granted_at,
                    expires_at,
                },
            );
        }

        debug!(lease_id = %id, count = names.len(), "Leases granted");
        id
    }

    /// Release the lease on a name. Returns false when none was held.
    pub fn release(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Live lease on a name, if any.
    pub fn get(&self, name: &str) -> Option<Lease> {
        self.lock()
            .get(name)
            .filter(|lease| !lease.is_expired())
            .cloned()
    }

    /// Whether a live lease covers the name.
    pub fn is_held(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names covered by live leases.
    pub fn held_names(&self) -> BTreeSet<String> {
        self.lock()
            .values()
            .filter(|lease| !lease.is_expired())
            .map(|lease| lease.slot_name.clone())
            .collect()
    }

    /// Drop expired leases, returning how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let mut leases = self.lock();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired());
        before - leases.len()
    }

    /// Number of live leases.
    pub fn len(&self) -> usize {
        self.held_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Lease>> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_grant_and_release() {
        let table = LeaseTable::new(Duration::from_secs(60));
        let id = table.grant(&names(&["slot-1", "slot-3"]));

        assert!(id.to_string().starts_with("lease_"));
        assert!(table.is_held("slot-1"));
        assert!(!table.is_held("slot-2"));
        assert_eq!(table.get("slot-3").unwrap().id, id);
        assert_eq!(table.len(), 2);

        assert!(table.release("slot-1"));
        assert!(!table.release("slot-1"));
        assert_eq!(
            table.held_names().into_iter().collect::<Vec<_>>(),
            vec!["slot-3"]
        );
    }

    #[test]
    fn test_expired_leases_do_not_shield() {
        let table = LeaseTable::new(Duration::ZERO);
        table.grant(&names(&["slot-1"]));

        assert!(!table.is_held("slot-1"));
        assert!(table.held_names().is_empty());
        assert!(table.is_empty());
        assert_eq!(table.prune_expired(), 1);
        assert_eq!(table.prune_expired(), 0);
    }

    #[test]
    fn test_regrant_replaces_lease() {
        let table = LeaseTable::new(Duration::from_secs(60));
        let first = table.grant(&names(&["slot-2"]));
        let second = table.grant(&names(&["slot-2"]));

        assert_ne!(first, second);
        assert_eq!(table.get("slot-2").unwrap().id, second);
        assert_eq!(table.len(), 1);
    }
}
