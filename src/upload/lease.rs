//! In-process leases keyed by string.
//!
//! A lease is a `tokio::sync::RwLock` shared by everyone asking for the
//! same key.  Holders take it exclusively or shared; shared holders run
//! alongside each other but never alongside an exclusive one.  Slots are
//! dropped from the registry once the last holder or waiter is gone, so
//! the map only holds keys that are in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Slot = Arc<RwLock<()>>;

#[derive(Default)]
pub struct KeyedLeases {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for and take the exclusive lease on `key`.  Released when the
    /// returned [`Lease`] is dropped.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Lease {
        let (slot, mut lease) = self.enter(key);
        lease.hold = Some(Hold::Exclusive(slot.write_owned().await));
        lease
    }

    /// Wait for and take a shared lease on `key`.
    pub async fn acquire_shared(self: &Arc<Self>, key: &str) -> Lease {
        let (slot, mut lease) = self.enter(key);
        lease.hold = Some(Hold::Shared(slot.read_owned().await));
        lease
    }

    /// Register interest in `key`.  The lease is built before waiting so a
    /// cancelled acquire still runs the cleanup in `Drop`.
    fn enter(self: &Arc<Self>, key: &str) -> (Slot, Lease) {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        let lease = Lease {
            key: key.to_string(),
            hold: None,
            registry: Arc::clone(self),
        };
        (slot, lease)
    }

    /// Number of keys currently leased or waited on.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

enum Hold {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A held lease.
pub struct Lease {
    key: String,
    hold: Option<Hold>,
    registry: Arc<KeyedLeases>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.hold, Some(Hold::Exclusive(_)))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.hold.take());
        let mut slots = self
            .registry
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&self.key) {
            // Only the registry's own reference is left.
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lease_is_exclusive_per_key() {
        let leases = KeyedLeases::new();
        let first = leases.acquire("a").await;
        assert!(first.is_exclusive());

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move {
                let _second = leases.acquire("a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_leases_overlap() {
        let leases = KeyedLeases::new();
        let first = leases.acquire_shared("a").await;
        assert!(!first.is_exclusive());
        let second =
            tokio::time::timeout(Duration::from_secs(1), leases.acquire_shared("a")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared_holders() {
        let leases = KeyedLeases::new();
        let shared = leases.acquire_shared("a").await;

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move {
                let _exclusive = leases.acquire("a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(shared);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leases.active(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let leases = KeyedLeases::new();
        let _a = leases.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), leases.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_slots_are_released() {
        let leases = KeyedLeases::new();
        {
            let lease = leases.acquire("a").await;
            assert_eq!(lease.key(), "a");
            assert_eq!(leases.active(), 1);
        }
        assert_eq!(leases.active(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let leases = KeyedLeases::new();
        let held = leases.acquire("a").await;
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), leases.acquire_shared("a")).await;
        assert!(timed_out.is_err());
        drop(held);
        assert_eq!(leases.active(), 0);
    }
}
