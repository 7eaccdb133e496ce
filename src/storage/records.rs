//! Persisted record types
//!
//! Plain data stored by the engine's stores. Behaviour lives with the
//! components that own each record kind.

use crate::core::{OutPoint, Output};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Output Ledger Records
// =============================================================================

/// Why an output is considered spent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpendOrigin {
    /// Consumed by a transaction this system broadcast
    Broadcast { tx_id: String },
    /// Consumed by a transaction built elsewhere
    External,
}

/// Ledger entry for a broadcasted or spent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub outpoint: OutPoint,
    /// Owning address, used to reconcile against the chain's unspent set
    pub address: String,
    pub value: u64,
    pub origin: SpendOrigin,
    pub recorded_at: DateTime<Utc>,
}

impl OutputRecord {
    pub fn broadcast(output: &Output, tx_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            outpoint: output.outpoint.clone(),
            address: output.address.clone(),
            value: output.value,
            origin: SpendOrigin::Broadcast {
                tx_id: tx_id.to_string(),
            },
            recorded_at: at,
        }
    }

    pub fn external(output: &Output, at: DateTime<Utc>) -> Self {
        Self {
            outpoint: output.outpoint.clone(),
            address: output.address.clone(),
            value: output.value,
            origin: SpendOrigin::External,
            recorded_at: at,
        }
    }

    pub fn spending_tx(&self) -> Option<&str> {
        match &self.origin {
            SpendOrigin::Broadcast { tx_id } => Some(tx_id),
            SpendOrigin::External => None,
        }
    }
}

// =============================================================================
// Wallet Records
// =============================================================================

/// A wallet address the detectors watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedWallet {
    pub address: String,
    pub subscribed_at: DateTime<Utc>,
}

/// Materialized balance of an observed wallet. Never stored with a zero
/// balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub address: String,
    pub balance: u64,
    pub as_of_block_height: u64,
}

/// One page of balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePage {
    pub items: Vec<WalletBalance>,
    /// Token for the next page, `None` on the last page
    pub continuation: Option<String>,
}

// =============================================================================
// Payment Operations
// =============================================================================

/// Lifecycle of a payment built by this system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum OperationStatus {
    Built,
    Broadcasted { tx_id: String },
    Completed { tx_id: String },
}

/// A payment built by this system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOperation {
    pub operation_id: String,
    pub source: String,
    pub destination: String,
    pub amount: u64,
    pub fee: u64,
    pub inputs: Vec<Output>,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    /// Last signed payload handed to the broadcaster, kept so a submission
    /// whose outcome is unknown can be repeated with the same bytes
    #[serde(default)]
    pub signed_hex: Option<String>,
}

impl PaymentOperation {
    pub fn tx_id(&self) -> Option<&str> {
        match &self.status {
            OperationStatus::Built => None,
            OperationStatus::Broadcasted { tx_id } | OperationStatus::Completed { tx_id } => {
                Some(tx_id)
            }
        }
    }
}

// =============================================================================
// Settlement Records
// =============================================================================

/// Direction of a settled transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettlementKind {
    CashIn,
    CashOut,
}

/// Which threshold a notification corresponds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettlementStage {
    /// Cash-in retry threshold reached; not final
    Advisory,
    /// Primary threshold reached
    Final,
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementKind::CashIn => write!(f, "cash-in"),
            SettlementKind::CashOut => write!(f, "cash-out"),
        }
    }
}

/// Key of a settlement record: one per `(tx_id, kind, stage)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementKey {
    pub tx_id: String,
    pub kind: SettlementKind,
    pub stage: SettlementStage,
}

/// A settlement observed at a threshold crossing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub tx_id: String,
    pub operation_id: String,
    pub kind: SettlementKind,
    pub stage: SettlementStage,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    /// Whether the sink acknowledged the notification
    pub delivered: bool,
    pub detected_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn key(&self) -> SettlementKey {
        SettlementKey {
            tx_id: self.tx_id.clone(),
            kind: self.kind,
            stage: self.stage,
        }
    }
}
