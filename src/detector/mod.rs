//! Settlement detection
//!
//! Polling detectors that watch incoming (cash-in) and outgoing (cash-out)
//! transactions until they reach their confirmation thresholds:
//!
//! ```text
//! Unseen -> Observed (confirmations < threshold) -> Settled
//! ```
//!
//! Entering `Settled` claims a settlement record with an insert-if-absent
//! write before the sink is called, so a notification is produced at most
//! once per `(tx_id, kind)`. Records whose delivery failed stay claimed and
//! are re-delivered on later polls as the same logical event.

pub mod cash_in;
pub mod cash_out;
pub mod scheduler;

use crate::core::EngineResult;
use crate::storage::{SettlementKind, SettlementRecord, SettlementStage, SettlementStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use cash_in::{CashInDetector, CashInThresholds};
pub use cash_out::CashOutDetector;
pub use scheduler::{spawn_periodic, PeriodicTask};

// =============================================================================
// Events and Sink
// =============================================================================

/// Notification raised when a transaction crosses a threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub tx_id: String,
    pub operation_id: String,
    pub kind: SettlementKind,
    pub stage: SettlementStage,
    pub confirmations: u32,
    pub address: String,
    pub amount: u64,
    pub detected_at: DateTime<Utc>,
}

impl From<&SettlementRecord> for SettlementEvent {
    fn from(record: &SettlementRecord) -> Self {
        Self {
            tx_id: record.tx_id.clone(),
            operation_id: record.operation_id.clone(),
            kind: record.kind,
            stage: record.stage,
            confirmations: record.confirmations,
            address: record.address.clone(),
            amount: record.amount,
            detected_at: record.detected_at,
        }
    }
}

/// Errors a sink reports back to the detector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Sink closed")]
    Closed,
}

/// Downstream consumer of settlement notifications
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn handle(&self, event: &SettlementEvent) -> Result<(), HandlerError>;
}

/// Sink that only writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl SettlementSink for LogSink {
    async fn handle(&self, event: &SettlementEvent) -> Result<(), HandlerError> {
        log::info!(
            "Settlement {} {:?} tx {} op {} ({} confirmations)",
            event.kind,
            event.stage,
            event.tx_id,
            event.operation_id,
            event.confirmations
        );
        Ok(())
    }
}

// =============================================================================
// Poll Bookkeeping
// =============================================================================

/// Counters for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub keys_polled: usize,
    pub keys_skipped: usize,
    pub advisories: usize,
    pub settled: usize,
    pub redelivered: usize,
    pub failures: usize,
}

impl PollReport {
    pub fn merge(&mut self, other: PollReport) {
        self.keys_polled += other.keys_polled;
        self.keys_skipped += other.keys_skipped;
        self.advisories += other.advisories;
        self.settled += other.settled;
        self.redelivered += other.redelivered;
        self.failures += other.failures;
    }
}

/// Keys (wallets or operations) currently being polled
#[derive(Debug, Default)]
pub struct InFlightKeys {
    keys: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InFlightKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `key`, or `None` if a poll for it is already running
    pub async fn try_enter(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .keys
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }

    /// Stop tracking a key that will not be polled again
    pub async fn forget(&self, key: &str) {
        self.keys.lock().await.remove(key);
    }

    /// Forget every key not in `live`
    pub async fn retain(&self, live: &HashSet<String>) {
        self.keys.lock().await.retain(|key, _| live.contains(key));
    }

    pub async fn len(&self) -> usize {
        self.keys.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.lock().await.is_empty()
    }
}

/// Deliver a claimed record and flag it delivered. Returns whether the sink
/// accepted it; a failure leaves the record for redelivery.
pub(crate) async fn deliver(
    settlements: &dyn SettlementStore,
    sink: &dyn SettlementSink,
    record: &SettlementRecord,
) -> EngineResult<bool> {
    match sink.handle(&SettlementEvent::from(record)).await {
        Ok(()) => {
            settlements.mark_delivered(&record.key()).await?;
            log::info!(
                "Settled {} tx {} (op {}, {} confirmations)",
                record.kind,
                record.tx_id,
                record.operation_id,
                record.confirmations
            );
            Ok(true)
        }
        Err(e) => {
            log::warn!(
                "Delivery of {} settlement {} failed, will retry: {}",
                record.kind,
                record.tx_id,
                e
            );
            Ok(false)
        }
    }
}

/// Retry delivery of claimed-but-undelivered final records of `kind`
pub(crate) async fn redeliver_pending(
    settlements: &dyn SettlementStore,
    sink: &dyn SettlementSink,
    kind: SettlementKind,
) -> EngineResult<PollReport> {
    let mut report = PollReport::default();
    let pending = settlements.undelivered().await?;
    for record in pending.iter().filter(|r| r.kind == kind) {
        if deliver(settlements, sink, record).await? {
            report.redelivered += 1;
        } else {
            report.failures += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// Sink that records events and can be told to fail
    #[derive(Default)]
    pub struct CollectingSink {
        pub events: RwLock<Vec<SettlementEvent>>,
        failures_left: AtomicUsize,
    }

    impl CollectingSink {
        pub fn failing(times: usize) -> Self {
            Self {
                events: RwLock::new(Vec::new()),
                failures_left: AtomicUsize::new(times),
            }
        }

        pub async fn count(&self, kind: SettlementKind, stage: SettlementStage) -> usize {
            self.events
                .read()
                .await
                .iter()
                .filter(|e| e.kind == kind && e.stage == stage)
                .count()
        }
    }

    #[async_trait]
    impl SettlementSink for CollectingSink {
        async fn handle(&self, event: &SettlementEvent) -> Result<(), HandlerError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(HandlerError::Delivery("downstream down".to_string()));
            }
            self.events.write().await.push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_flight_refuses_overlap() {
        let keys = InFlightKeys::new();
        let first = keys.try_enter("W").await;
        assert!(first.is_some());
        assert!(keys.try_enter("W").await.is_none());
        assert!(keys.try_enter("V").await.is_some());

        drop(first);
        assert!(keys.try_enter("W").await.is_some());
    }

    #[test]
    fn test_report_merge() {
        let mut total = PollReport {
            keys_polled: 1,
            settled: 1,
            ..Default::default()
        };
        total.merge(PollReport {
            keys_polled: 2,
            failures: 1,
            ..Default::default()
        });
        assert_eq!(total.keys_polled, 3);
        assert_eq!(total.settled, 1);
        assert_eq!(total.failures, 1);
    }
}
