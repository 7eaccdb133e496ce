//! Cash-in detector
//!
//! Incoming transactions of an observed wallet are read off its unspent
//! outputs (including unconfirmed ones). Once observed, a transaction stays
//! tracked by id until it settles or leaves the chain, so a deposit the
//! wallet spends early still settles. Two thresholds apply:
//!
//! - **retry**: best-effort advisory delivery, retried every poll until one
//!   delivery succeeds or the primary threshold is reached
//! - **primary**: claims the final settlement record and delivers it
//!
//! Outputs created by our own payments (change) are not cash-ins.

use crate::chain::ChainGateway;
use crate::core::{tagged_id, EngineError, EngineResult};
use crate::detector::{
    deliver, redeliver_pending, InFlightKeys, PollReport, SettlementEvent, SettlementSink,
};
use crate::storage::{
    OperationStore, SettlementKey, SettlementKind, SettlementRecord, SettlementStage,
    SettlementStore, WalletStore,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Confirmation thresholds for incoming transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashInThresholds {
    pub retry: u32,
    pub primary: u32,
}

impl CashInThresholds {
    pub fn new(retry: u32, primary: u32) -> EngineResult<Self> {
        if primary == 0 || retry >= primary {
            return Err(EngineError::InvalidInput(format!(
                "retry threshold {} must be below primary threshold {}",
                retry, primary
            )));
        }
        Ok(Self { retry, primary })
    }
}

impl Default for CashInThresholds {
    fn default() -> Self {
        Self {
            retry: 2,
            primary: 6,
        }
    }
}

/// An incoming transaction as seen through a wallet's unspent outputs
#[derive(Debug, Clone, PartialEq, Eq)]
struct Incoming {
    tx_id: String,
    amount: u64,
    confirmations: u32,
}

pub struct CashInDetector {
    chain: ChainGateway,
    wallets: Arc<dyn WalletStore>,
    operations: Arc<dyn OperationStore>,
    settlements: Arc<dyn SettlementStore>,
    sink: Arc<dyn SettlementSink>,
    thresholds: CashInThresholds,
    in_flight: InFlightKeys,
    /// Observed, unsettled incoming tx ids per wallet
    tracked: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Whether `tracked` was rebuilt from stored advisories
    seeded: AtomicBool,
    concurrency: usize,
}

impl CashInDetector {
    pub fn new(
        chain: ChainGateway,
        wallets: Arc<dyn WalletStore>,
        operations: Arc<dyn OperationStore>,
        settlements: Arc<dyn SettlementStore>,
        sink: Arc<dyn SettlementSink>,
        thresholds: CashInThresholds,
    ) -> Self {
        Self {
            chain,
            wallets,
            operations,
            settlements,
            sink,
            thresholds,
            in_flight: InFlightKeys::new(),
            tracked: RwLock::new(HashMap::new()),
            seeded: AtomicBool::new(false),
            concurrency: 4,
        }
    }

    /// Maximum wallets polled at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn thresholds(&self) -> CashInThresholds {
        self.thresholds
    }

    /// One poll cycle over every observed wallet
    pub async fn poll(&self) -> EngineResult<PollReport> {
        let mut report =
            redeliver_pending(self.settlements.as_ref(), self.sink.as_ref(), SettlementKind::CashIn)
                .await?;

        self.seed_tracked().await?;

        let wallets = self.wallets.list().await?;
        let observed: HashSet<String> = wallets.iter().map(|w| w.address.clone()).collect();
        self.in_flight.retain(&observed).await;
        self.tracked
            .write()
            .await
            .retain(|address, _| observed.contains(address));

        let results: Vec<(String, EngineResult<PollReport>)> = stream::iter(wallets)
            .map(|wallet| async move {
                let result = self.poll_wallet(&wallet.address).await;
                (wallet.address, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (address, result) in results {
            match result {
                Ok(wallet_report) => report.merge(wallet_report),
                Err(e) => {
                    log::warn!("Cash-in poll for {} failed: {}", address, e);
                    report.failures += 1;
                }
            }
        }

        log::debug!("Cash-in poll: {:?}", report);
        Ok(report)
    }

    /// Poll a single wallet
    pub async fn poll_wallet(&self, address: &str) -> EngineResult<PollReport> {
        let mut report = PollReport::default();
        let _guard = match self.in_flight.try_enter(address).await {
            Some(guard) => guard,
            None => {
                log::debug!("Cash-in poll for {} still running, skipping", address);
                report.keys_skipped += 1;
                return Ok(report);
            }
        };
        report.keys_polled += 1;

        let mut candidates = self.incoming(address).await?;
        let visible: HashSet<String> = candidates.iter().map(|i| i.tx_id.clone()).collect();
        let hidden: Vec<String> = self
            .tracked
            .read()
            .await
            .get(address)
            .map(|txs| txs.iter().filter(|t| !visible.contains(*t)).cloned().collect())
            .unwrap_or_default();

        // tracked transactions whose outputs were already spent
        for tx_id in hidden {
            match self.chain.transaction(&tx_id).await? {
                Some(info) => candidates.push(Incoming {
                    amount: info
                        .outputs
                        .iter()
                        .filter(|o| o.recipient == address)
                        .fold(0u64, |sum, o| sum.saturating_add(o.amount)),
                    confirmations: info.confirmations,
                    tx_id,
                }),
                None => {
                    log::info!("Cash-in {} to {} left the chain", tx_id, address);
                    self.untrack(address, &tx_id).await;
                }
            }
        }

        for incoming in candidates {
            if self.is_own_change(address, &incoming.tx_id).await? {
                continue;
            }

            if incoming.confirmations >= self.thresholds.primary {
                self.settle(address, &incoming, &mut report).await?;
                self.untrack(address, &incoming.tx_id).await;
            } else {
                self.track(address, &incoming.tx_id).await;
                if incoming.confirmations >= self.thresholds.retry {
                    self.advise(address, &incoming, &mut report).await?;
                }
            }
        }
        Ok(report)
    }

    async fn track(&self, address: &str, tx_id: &str) {
        self.tracked
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .insert(tx_id.to_string());
    }

    async fn untrack(&self, address: &str, tx_id: &str) {
        let mut tracked = self.tracked.write().await;
        if let Some(txs) = tracked.get_mut(address) {
            txs.remove(tx_id);
            if txs.is_empty() {
                tracked.remove(address);
            }
        }
    }

    /// Rebuild tracking from advisories that never reached a final record
    async fn seed_tracked(&self) -> EngineResult<()> {
        if self.seeded.load(Ordering::Acquire) {
            return Ok(());
        }
        let records = self.settlements.list().await?;
        let finals: HashSet<&str> = records
            .iter()
            .filter(|r| r.kind == SettlementKind::CashIn && r.stage == SettlementStage::Final)
            .map(|r| r.tx_id.as_str())
            .collect();

        let mut tracked = self.tracked.write().await;
        for record in records.iter().filter(|r| {
            r.kind == SettlementKind::CashIn
                && r.stage == SettlementStage::Advisory
                && !finals.contains(r.tx_id.as_str())
        }) {
            tracked
                .entry(record.address.clone())
                .or_default()
                .insert(record.tx_id.clone());
        }
        drop(tracked);

        self.seeded.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether `tx_id` is one of our payments returning change to `address`
    async fn is_own_change(&self, address: &str, tx_id: &str) -> EngineResult<bool> {
        Ok(self
            .operations
            .find_by_tx_id(tx_id)
            .await?
            .is_some_and(|op| op.source == address))
    }

    /// Group the wallet's unspent outputs by transaction
    async fn incoming(&self, address: &str) -> EngineResult<Vec<Incoming>> {
        let outputs = self.chain.unspent_outputs(address, 0).await?;

        let mut by_tx: BTreeMap<String, Incoming> = BTreeMap::new();
        let mut seen = HashSet::new();
        for output in outputs.into_iter().filter(|o| o.is_owned_by(address)) {
            if !seen.insert(output.outpoint.clone()) {
                continue;
            }
            let entry = by_tx
                .entry(output.outpoint.tx_id.clone())
                .or_insert_with(|| Incoming {
                    tx_id: output.outpoint.tx_id.clone(),
                    amount: 0,
                    confirmations: output.confirmations,
                });
            entry.amount = entry.amount.saturating_add(output.value);
            entry.confirmations = entry.confirmations.min(output.confirmations);
        }
        Ok(by_tx.into_values().collect())
    }

    fn record(&self, address: &str, incoming: &Incoming, stage: SettlementStage) -> SettlementRecord {
        SettlementRecord {
            tx_id: incoming.tx_id.clone(),
            operation_id: cash_in_operation_id(&incoming.tx_id, address),
            kind: SettlementKind::CashIn,
            stage,
            address: address.to_string(),
            amount: incoming.amount,
            confirmations: incoming.confirmations,
            delivered: false,
            detected_at: Utc::now(),
        }
    }

    async fn settle(
        &self,
        address: &str,
        incoming: &Incoming,
        report: &mut PollReport,
    ) -> EngineResult<()> {
        let record = self.record(address, incoming, SettlementStage::Final);
        if !self.settlements.insert_if_absent(record.clone()).await? {
            return Ok(());
        }
        if deliver(self.settlements.as_ref(), self.sink.as_ref(), &record).await? {
            report.settled += 1;
        } else {
            report.failures += 1;
        }
        Ok(())
    }

    async fn advise(
        &self,
        address: &str,
        incoming: &Incoming,
        report: &mut PollReport,
    ) -> EngineResult<()> {
        let key = SettlementKey {
            tx_id: incoming.tx_id.clone(),
            kind: SettlementKind::CashIn,
            stage: SettlementStage::Advisory,
        };
        if self.settlements.get(&key).await?.is_some() {
            return Ok(());
        }

        let mut record = self.record(address, incoming, SettlementStage::Advisory);
        match self.sink.handle(&SettlementEvent::from(&record)).await {
            Ok(()) => {
                record.delivered = true;
                self.settlements.insert_if_absent(record).await?;
                report.advisories += 1;
                log::info!(
                    "Cash-in {} to {} at {} confirmations (advisory)",
                    incoming.tx_id,
                    address,
                    incoming.confirmations
                );
            }
            Err(e) => {
                log::warn!(
                    "Advisory cash-in handling for {} failed, retrying next poll: {}",
                    incoming.tx_id,
                    e
                );
                report.failures += 1;
            }
        }
        Ok(())
    }
}

/// Stable operation id for an incoming transaction
pub fn cash_in_operation_id(tx_id: &str, address: &str) -> String {
    tagged_id("cash-in", &[tx_id, address])
}

// =============================================================================
// Tests
// =============================================================================
