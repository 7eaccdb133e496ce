//! Output Ledger
//!
//! Two append/expire stores of outputs this system must not select again:
//! - *Broadcasted outputs*: consumed by a transaction we submitted, until the
//!   chain reader stops reporting them as unspent.
//! - *Spent outputs*: superset of the above, plus outputs seen consumed by
//!   transactions built elsewhere.
//!
//! Entries stop excluding their output once their retention window elapses.
//! An expired broadcast means the chain never confirmed our spend; the output
//! becomes spendable again, which is how abandoned broadcasts heal.
//! Externally observed spends only expire when `expire_external` is set.

use crate::core::{EngineResult, OutPoint, Output};
use crate::storage::{OutputRecord, OutputRecordStore, SpendOrigin};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

// =============================================================================
// Retention Policy
// =============================================================================

/// Retention windows per record kind
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub broadcasted: Duration,
    pub spent: Duration,
    /// Whether externally observed spends expire after `spent`
    pub expire_external: bool,
}

impl RetentionPolicy {
    pub fn from_days(broadcasted_days: u32, spent_days: u32, expire_external: bool) -> Self {
        Self {
            broadcasted: Duration::days(broadcasted_days as i64),
            spent: Duration::days(spent_days as i64),
            expire_external,
        }
    }

    fn broadcast_expired(&self, record: &OutputRecord, now: DateTime<Utc>) -> bool {
        now - record.recorded_at > self.broadcasted
    }

    fn spent_expired(&self, record: &OutputRecord, now: DateTime<Utc>) -> bool {
        match record.origin {
            SpendOrigin::Broadcast { .. } => now - record.recorded_at > self.spent,
            SpendOrigin::External => self.expire_external && now - record.recorded_at > self.spent,
        }
    }

    /// Whether an output with these records is excluded at `now`
    fn excludes(
        &self,
        broadcasted: Option<&OutputRecord>,
        spent: Option<&OutputRecord>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut abandoned_tx = None;
        if let Some(record) = broadcasted {
            if !self.broadcast_expired(record, now) {
                return true;
            }
            abandoned_tx = record.spending_tx();
        }

        match spent {
            None => false,
            Some(record) => {
                // the spend record of an abandoned broadcast heals with it
                if abandoned_tx.is_some() && record.spending_tx() == abandoned_tx {
                    return false;
                }
                !self.spent_expired(record, now)
            }
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(7, 7, false)
    }
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Broadcasts the chain never confirmed
    pub expired_broadcasts: Vec<OutPoint>,
    pub expired_spent: Vec<OutPoint>,
}

// =============================================================================
// Output Ledger
// =============================================================================

pub struct OutputLedger {
    broadcasted: Arc<dyn OutputRecordStore>,
    spent: Arc<dyn OutputRecordStore>,
    policy: RetentionPolicy,
}

impl OutputLedger {
    pub fn new(
        broadcasted: Arc<dyn OutputRecordStore>,
        spent: Arc<dyn OutputRecordStore>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            broadcasted,
            spent,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Record outputs consumed by a submitted transaction.
    ///
    /// Re-marking an output with the same transaction id is a no-op. Returns
    /// the number of newly recorded outputs.
    pub async fn mark_broadcasted(&self, outputs: &[Output], tx_id: &str) -> EngineResult<usize> {
        self.mark_broadcasted_at(outputs, tx_id, Utc::now()).await
    }

    pub async fn mark_broadcasted_at(
        &self,
        outputs: &[Output],
        tx_id: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let mut inserted = 0;
        for output in outputs {
            let record = OutputRecord::broadcast(output, tx_id, at);
            if self.broadcasted.insert_if_absent(record.clone()).await? {
                inserted += 1;
            } else if let Some(existing) = self.broadcasted.get(&output.outpoint).await? {
                if existing.spending_tx() != Some(tx_id) {
                    log::warn!(
                        "Output {} already marked broadcasted by {:?}, ignoring {}",
                        output.outpoint,
                        existing.spending_tx(),
                        tx_id
                    );
                }
            }
            self.spent.insert_if_absent(record).await?;
        }

        if inserted > 0 {
            log::debug!("Marked {} outputs broadcasted by {}", inserted, tx_id);
        }
        Ok(inserted)
    }

    /// Record an output consumed by a transaction this system did not build
    pub async fn mark_externally_spent(&self, output: &Output) -> EngineResult<bool> {
        self.mark_externally_spent_at(output, Utc::now()).await
    }

    pub async fn mark_externally_spent_at(
        &self,
        output: &Output,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let inserted = self
            .spent
            .insert_if_absent(OutputRecord::external(output, at))
            .await?;
        if inserted {
            log::info!("Output {} marked externally spent", output.outpoint);
        }
        Ok(inserted)
    }

    /// Whether the output must be left out of new transactions right now
    pub async fn is_excluded(&self, outpoint: &OutPoint) -> EngineResult<bool> {
        self.is_excluded_at(outpoint, Utc::now()).await
    }

    pub async fn is_excluded_at(&self, outpoint: &OutPoint, now: DateTime<Utc>) -> EngineResult<bool> {
        let broadcasted = self.broadcasted.get(outpoint).await?;
        let spent = self.spent.get(outpoint).await?;
        Ok(self
            .policy
            .excludes(broadcasted.as_ref(), spent.as_ref(), now))
    }

    /// Every outpoint currently excluded, taken in one pass over both stores
    pub async fn excluded_outpoints(&self, now: DateTime<Utc>) -> EngineResult<HashSet<OutPoint>> {
        let broadcasted: HashMap<OutPoint, OutputRecord> = self
            .broadcasted
            .list()
            .await?
            .into_iter()
            .map(|r| (r.outpoint.clone(), r))
            .collect();
        let spent: HashMap<OutPoint, OutputRecord> = self
            .spent
            .list()
            .await?
            .into_iter()
            .map(|r| (r.outpoint.clone(), r))
            .collect();

        let mut excluded = HashSet::new();
        for outpoint in broadcasted.keys().chain(spent.keys()) {
            if self
                .policy
                .excludes(broadcasted.get(outpoint), spent.get(outpoint), now)
            {
                excluded.insert(outpoint.clone());
            }
        }
        Ok(excluded)
    }

    /// Remove entries older than their retention window
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();

        let cutoff = now - self.policy.broadcasted;
        for record in self.broadcasted.older_than(cutoff).await? {
            let Some(removed) = self.broadcasted.remove_if_older(&record.outpoint, cutoff).await?
            else {
                continue;
            };
            log::warn!(
                "Broadcast of {} by {:?} expired unconfirmed after {} days, output released",
                removed.outpoint,
                removed.spending_tx(),
                self.policy.broadcasted.num_days()
            );

            if let Some(spent) = self.spent.get(&removed.outpoint).await? {
                if spent.spending_tx() == removed.spending_tx() {
                    self.spent.remove_if_older(&removed.outpoint, cutoff).await?;
                }
            }
            report.expired_broadcasts.push(removed.outpoint);
        }

        let cutoff = now - self.policy.spent;
        for record in self.spent.older_than(cutoff).await? {
            if !self.policy.spent_expired(&record, now) {
                continue;
            }
            if let Some(removed) = self.spent.remove_if_older(&record.outpoint, cutoff).await? {
                log::debug!("Spent record for {} expired", removed.outpoint);
                report.expired_spent.push(removed.outpoint);
            }
        }

        Ok(report)
    }

    /// Drop broadcasted records the chain has caught up on: outputs of
    /// `address` absent from `chain_unspent` are now spent on-chain.
    /// Spent records the chain agrees with are dropped once past the spent
    /// window regardless of origin.
    pub async fn reconcile(
        &self,
        address: &str,
        chain_unspent: &[Output],
        now: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let reported: HashSet<&OutPoint> = chain_unspent.iter().map(|o| &o.outpoint).collect();
        let mut removed = 0;

        for record in self.broadcasted.list().await? {
            if record.address == address && !reported.contains(&record.outpoint) {
                self.broadcasted.remove(&record.outpoint).await?;
                log::debug!(
                    "Chain caught up on {} spent by {:?}",
                    record.outpoint,
                    record.spending_tx()
                );
                removed += 1;
            }
        }

        let cutoff = now - self.policy.spent;
        for record in self.spent.older_than(cutoff).await? {
            if record.address == address
                && !reported.contains(&record.outpoint)
                && self
                    .spent
                    .remove_if_older(&record.outpoint, cutoff)
                    .await?
                    .is_some()
            {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Addresses that own at least one ledger entry
    pub async fn tracked_addresses(&self) -> EngineResult<BTreeSet<String>> {
        let mut addresses: BTreeSet<String> = self
            .broadcasted
            .list()
            .await?
            .into_iter()
            .map(|r| r.address)
            .collect();
        addresses.extend(self.spent.list().await?.into_iter().map(|r| r.address));
        Ok(addresses)
    }

    pub async fn broadcasted_records(&self) -> EngineResult<Vec<OutputRecord>> {
        Ok(self.broadcasted.list().await?)
    }

    pub async fn spent_records(&self) -> EngineResult<Vec<OutputRecord>> {
        Ok(self.spent.list().await?)
    }
}

// =============================================================================
// Tests
// =============================================================================
