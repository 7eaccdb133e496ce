//! Per-address locks and output reservations
//!
//! Building and broadcasting for one source address are serialized by an
//! [`AddressLocks`] entry. Outputs picked by a built payment are reserved
//! until it is broadcast, rejected or the reservation times out, so a second
//! build never selects them while the first is in flight.

use crate::core::OutPoint;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

// =============================================================================
// Address Locks
// =============================================================================

/// One async mutex per source address
#[derive(Debug, Default)]
pub struct AddressLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `address`
    pub async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// =============================================================================
// Reservations
// =============================================================================

#[derive(Debug, Clone)]
struct Reservation {
    outpoints: Vec<OutPoint>,
    expires_at: DateTime<Utc>,
}

/// Outputs held by built-but-not-broadcast payments
#[derive(Debug)]
pub struct Reservations {
    entries: RwLock<HashMap<String, Reservation>>,
    ttl: Duration,
}

impl Reservations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Reserve outpoints for an operation until the TTL elapses
    pub async fn reserve(&self, operation_id: &str, outpoints: Vec<OutPoint>) {
        let reservation = Reservation {
            outpoints,
            expires_at: Utc::now() + self.ttl,
        };
        self.entries
            .write()
            .await
            .insert(operation_id.to_string(), reservation);
    }

    /// Release an operation's reservation, returning whether it existed
    pub async fn release(&self, operation_id: &str) -> bool {
        self.entries.write().await.remove(operation_id).is_some()
    }

    /// Outpoints reserved and unexpired at `now`
    pub async fn reserved(&self, now: DateTime<Utc>) -> HashSet<OutPoint> {
        self.entries
            .read()
            .await
            .values()
            .filter(|r| r.expires_at > now)
            .flat_map(|r| r.outpoints.iter().cloned())
            .collect()
    }

    /// Drop expired reservations, returning how many were dropped
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, r| r.expires_at > now);
        before - entries.len()
    }
}

impl Default for Reservations {
    fn default() -> Self {
        Self::new(Duration::minutes(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let reservations = Reservations::default();
        reservations
            .reserve("op1", vec![OutPoint::new("tx", 0), OutPoint::new("tx", 1)])
            .await;

        let reserved = reservations.reserved(Utc::now()).await;
        assert_eq!(reserved.len(), 2);

        assert!(reservations.release("op1").await);
        assert!(!reservations.release("op1").await);
        assert!(reservations.reserved(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_reservations_ignored() {
        let reservations = Reservations::new(Duration::seconds(30));
        reservations.reserve("op1", vec![OutPoint::new("tx", 0)]).await;

        let later = Utc::now() + Duration::minutes(1);
        assert!(reservations.reserved(later).await.is_empty());
        assert_eq!(reservations.purge_expired(later).await, 1);
    }

    #[tokio::test]
    async fn test_address_lock_serializes() {
        let locks = Arc::new(AddressLocks::new());
        let guard = locks.acquire("A").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("A").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // other addresses are independent
        let _other = locks.acquire("B").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
