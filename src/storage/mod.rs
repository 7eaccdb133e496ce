//! Storage contracts and implementations
//!
//! The engine talks to its state through the store traits below so a
//! durable engine can replace the in-memory backend. Every store supports
//! upsert, point delete and the scans the components need; `insert_if_absent`
//! is the compare-and-swap primitive behind idempotent ledger writes and
//! at-most-once settlement records.

pub mod memory;
pub mod persistence;
pub mod records;

use crate::core::OutPoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

pub use memory::{
    MemoryBackend, MemoryBalanceStore, MemoryOperationStore, MemoryOutputRecords,
    MemorySettlementStore, MemoryWalletStore,
};
pub use persistence::{StateSnapshot, Storage, StorageConfig, StorageStats};
pub use records::{
    BalancePage, ObservedWallet, OperationStatus, OutputRecord, PaymentOperation,
    SettlementKey, SettlementKind, SettlementRecord, SettlementStage, SpendOrigin,
    WalletBalance,
};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// =============================================================================
// Store Traits
// =============================================================================

/// Store of broadcasted or spent output records, keyed by outpoint
#[async_trait]
pub trait OutputRecordStore: Send + Sync {
    /// Insert unless the outpoint already has a record. Returns whether the
    /// record was inserted.
    async fn insert_if_absent(&self, record: OutputRecord) -> Result<bool, StorageError>;

    async fn get(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StorageError>;

    async fn remove(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StorageError>;

    /// Remove the record only if it was recorded before `cutoff`
    async fn remove_if_older(
        &self,
        outpoint: &OutPoint,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<OutputRecord>, StorageError>;

    /// Records recorded before `cutoff`, oldest first
    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutputRecord>, StorageError>;

    async fn list(&self) -> Result<Vec<OutputRecord>, StorageError>;
}

/// Observed wallet set
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Returns false if the wallet was already observed
    async fn insert(&self, wallet: ObservedWallet) -> Result<bool, StorageError>;

    /// Returns false if the wallet was not observed
    async fn delete(&self, address: &str) -> Result<bool, StorageError>;

    async fn get(&self, address: &str) -> Result<Option<ObservedWallet>, StorageError>;

    async fn list(&self) -> Result<Vec<ObservedWallet>, StorageError>;
}

/// Materialized wallet balances
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn upsert(&self, balance: WalletBalance) -> Result<(), StorageError>;

    async fn get(&self, address: &str) -> Result<Option<WalletBalance>, StorageError>;

    async fn delete_if_exists(&self, address: &str) -> Result<bool, StorageError>;

    /// Page ordered by address, starting after `continuation`
    async fn page(
        &self,
        take: usize,
        continuation: Option<&str>,
    ) -> Result<BalancePage, StorageError>;
}

/// Payment operations built by this system
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn upsert(&self, operation: PaymentOperation) -> Result<(), StorageError>;

    async fn get(&self, operation_id: &str) -> Result<Option<PaymentOperation>, StorageError>;

    async fn find_by_tx_id(&self, tx_id: &str) -> Result<Option<PaymentOperation>, StorageError>;

    /// Operations broadcast but not yet completed
    async fn list_broadcasted(&self) -> Result<Vec<PaymentOperation>, StorageError>;

    async fn list(&self) -> Result<Vec<PaymentOperation>, StorageError>;

    async fn delete(&self, operation_id: &str) -> Result<bool, StorageError>;
}

/// Settlement records, at most one per key
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Claim the record's key. Returns false if it was already claimed.
    async fn insert_if_absent(&self, record: SettlementRecord) -> Result<bool, StorageError>;

    async fn get(&self, key: &SettlementKey) -> Result<Option<SettlementRecord>, StorageError>;

    async fn mark_delivered(&self, key: &SettlementKey) -> Result<(), StorageError>;

    /// Claimed records whose notification was not acknowledged yet
    async fn undelivered(&self) -> Result<Vec<SettlementRecord>, StorageError>;

    async fn list(&self) -> Result<Vec<SettlementRecord>, StorageError>;
}
