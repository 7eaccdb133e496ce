//! In-memory store implementations
//!
//! Each store guards its table with a `tokio::sync::RwLock`; every trait
//! method is atomic per entry. [`MemoryBackend`] bundles one of each so the
//! whole state can be snapshotted to disk and restored at startup.

use crate::core::OutPoint;
use crate::storage::persistence::StateSnapshot;
use crate::storage::records::{
    BalancePage, ObservedWallet, OperationStatus, OutputRecord, PaymentOperation, SettlementKey,
    SettlementRecord, WalletBalance,
};
use crate::storage::{
    BalanceStore, OperationStore, OutputRecordStore, SettlementStore, StorageError, WalletStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Output Records
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryOutputRecords {
    records: RwLock<HashMap<OutPoint, OutputRecord>>,
}

impl MemoryOutputRecords {
    pub fn new() -> Self {
        Self::default()
    }

    async fn export(&self) -> Vec<OutputRecord> {
        let mut records: Vec<OutputRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        records
    }

    async fn import(&self, records: Vec<OutputRecord>) {
        let mut table = self.records.write().await;
        table.clear();
        for record in records {
            table.insert(record.outpoint.clone(), record);
        }
    }
}

#[async_trait]
impl OutputRecordStore for MemoryOutputRecords {
    async fn insert_if_absent(&self, record: OutputRecord) -> Result<bool, StorageError> {
        let mut table = self.records.write().await;
        if table.contains_key(&record.outpoint) {
            return Ok(false);
        }
        table.insert(record.outpoint.clone(), record);
        Ok(true)
    }

    async fn get(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StorageError> {
        Ok(self.records.read().await.get(outpoint).cloned())
    }

    async fn remove(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StorageError> {
        Ok(self.records.write().await.remove(outpoint))
    }

    async fn remove_if_older(
        &self,
        outpoint: &OutPoint,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<OutputRecord>, StorageError> {
        let mut table = self.records.write().await;
        match table.get(outpoint) {
            Some(record) if record.recorded_at < cutoff => Ok(table.remove(outpoint)),
            _ => Ok(None),
        }
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutputRecord>, StorageError> {
        let mut records: Vec<OutputRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.recorded_at < cutoff)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<OutputRecord>, StorageError> {
        Ok(self.export().await)
    }
}

// =============================================================================
// Wallets and Balances
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    wallets: RwLock<BTreeMap<String, ObservedWallet>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn insert(&self, wallet: ObservedWallet) -> Result<bool, StorageError> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(&wallet.address) {
            return Ok(false);
        }
        wallets.insert(wallet.address.clone(), wallet);
        Ok(true)
    }

    async fn delete(&self, address: &str) -> Result<bool, StorageError> {
        Ok(self.wallets.write().await.remove(address).is_some())
    }

    async fn get(&self, address: &str) -> Result<Option<ObservedWallet>, StorageError> {
        Ok(self.wallets.read().await.get(address).cloned())
    }

    async fn list(&self) -> Result<Vec<ObservedWallet>, StorageError> {
        Ok(self.wallets.read().await.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    balances: RwLock<BTreeMap<String, WalletBalance>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn upsert(&self, balance: WalletBalance) -> Result<(), StorageError> {
        self.balances
            .write()
            .await
            .insert(balance.address.clone(), balance);
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<WalletBalance>, StorageError> {
        Ok(self.balances.read().await.get(address).cloned())
    }

    async fn delete_if_exists(&self, address: &str) -> Result<bool, StorageError> {
        Ok(self.balances.write().await.remove(address).is_some())
    }

    async fn page(
        &self,
        take: usize,
        continuation: Option<&str>,
    ) -> Result<BalancePage, StorageError> {
        let balances = self.balances.read().await;
        let start = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        let mut iter = balances.range((start, Bound::Unbounded));
        let items: Vec<WalletBalance> = iter.by_ref().take(take).map(|(_, b)| b.clone()).collect();
        let continuation = match (iter.next(), items.last()) {
            (Some(_), Some(last)) => Some(last.address.clone()),
            _ => None,
        };

        Ok(BalancePage {
            items,
            continuation,
        })
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    operations: RwLock<BTreeMap<String, PaymentOperation>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn upsert(&self, operation: PaymentOperation) -> Result<(), StorageError> {
        self.operations
            .write()
            .await
            .insert(operation.operation_id.clone(), operation);
        Ok(())
    }

    async fn get(&self, operation_id: &str) -> Result<Option<PaymentOperation>, StorageError> {
        Ok(self.operations.read().await.get(operation_id).cloned())
    }

    async fn find_by_tx_id(&self, tx_id: &str) -> Result<Option<PaymentOperation>, StorageError> {
        Ok(self
            .operations
            .read()
            .await
            .values()
            .find(|op| op.tx_id() == Some(tx_id))
            .cloned())
    }

    async fn list_broadcasted(&self) -> Result<Vec<PaymentOperation>, StorageError> {
        Ok(self
            .operations
            .read()
            .await
            .values()
            .filter(|op| matches!(op.status, OperationStatus::Broadcasted { .. }))
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<PaymentOperation>, StorageError> {
        Ok(self.operations.read().await.values().cloned().collect())
    }

    async fn delete(&self, operation_id: &str) -> Result<bool, StorageError> {
        Ok(self.operations.write().await.remove(operation_id).is_some())
    }
}

// =============================================================================
// Settlements
// =============================================================================

#[derive(Debug, Default)]
pub struct MemorySettlementStore {
    records: RwLock<BTreeMap<SettlementKey, SettlementRecord>>,
}

impl MemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for MemorySettlementStore {
    async fn insert_if_absent(&self, record: SettlementRecord) -> Result<bool, StorageError> {
        let mut records = self.records.write().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record);
        Ok(true)
    }

    async fn get(&self, key: &SettlementKey) -> Result<Option<SettlementRecord>, StorageError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn mark_delivered(&self, key: &SettlementKey) -> Result<(), StorageError> {
        match self.records.write().await.get_mut(key) {
            Some(record) => {
                record.delivered = true;
                Ok(())
            }
            None => Err(StorageError::InvalidData(format!(
                "no settlement record for {} ({})",
                key.tx_id, key.kind
            ))),
        }
    }

    async fn undelivered(&self) -> Result<Vec<SettlementRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.delivered)
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<SettlementRecord>, StorageError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// One in-memory instance of every store
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    pub broadcasted: Arc<MemoryOutputRecords>,
    pub spent: Arc<MemoryOutputRecords>,
    pub wallets: Arc<MemoryWalletStore>,
    pub balances: Arc<MemoryBalanceStore>,
    pub operations: Arc<MemoryOperationStore>,
    pub settlements: Arc<MemorySettlementStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every table into a serializable snapshot
    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            broadcasted_outputs: self.broadcasted.export().await,
            spent_outputs: self.spent.export().await,
            wallets: self.wallets.wallets.read().await.values().cloned().collect(),
            balances: self.balances.balances.read().await.values().cloned().collect(),
            operations: self.operations.operations.read().await.values().cloned().collect(),
            settlements: self.settlements.records.read().await.values().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    /// Replace every table with the snapshot's contents
    pub async fn restore(&self, snapshot: StateSnapshot) {
        self.broadcasted.import(snapshot.broadcasted_outputs).await;
        self.spent.import(snapshot.spent_outputs).await;

        let mut wallets = self.wallets.wallets.write().await;
        wallets.clear();
        wallets.extend(snapshot.wallets.into_iter().map(|w| (w.address.clone(), w)));
        drop(wallets);

        let mut balances = self.balances.balances.write().await;
        balances.clear();
        balances.extend(snapshot.balances.into_iter().map(|b| (b.address.clone(), b)));
        drop(balances);

        let mut operations = self.operations.operations.write().await;
        operations.clear();
        operations.extend(
            snapshot
                .operations
                .into_iter()
                .map(|op| (op.operation_id.clone(), op)),
        );
        drop(operations);

        let mut settlements = self.settlements.records.write().await;
        settlements.clear();
        settlements.extend(snapshot.settlements.into_iter().map(|r| (r.key(), r)));
    }
}

// =============================================================================
// Tests
// =============================================================================
