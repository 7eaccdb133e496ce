//! Payment transaction data
//!
//! Unsigned transactions are produced by the payment builder and handed to
//! the signing facade; signed transactions come back as raw hex bytes tied
//! to the operation that built them.

use crate::core::fee::estimate_tx_size;
use crate::core::hash::sha256_hex;
use crate::core::output::{OutPoint, Output};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Transaction Output
// =============================================================================

/// Output of a transaction being built
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    /// Amount in the smallest unit
    pub amount: u64,
    /// Recipient address
    pub recipient: String,
}

// =============================================================================
// Unsigned Transaction
// =============================================================================

/// An unsigned payment ready for the signing facade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedTransaction {
    /// Operation that owns this payment
    pub operation_id: String,
    /// Outputs consumed by this transaction
    pub inputs: Vec<Output>,
    /// Payment output first, optional change output second
    pub outputs: Vec<TransactionOutput>,
    /// Absolute fee (input total minus output total)
    pub fee: u64,
    /// Estimated serialized size used for the fee
    pub estimated_size: usize,
    pub created_at: DateTime<Utc>,
}

impl UnsignedTransaction {
    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Change returned to the source, if a change output was kept
    pub fn change(&self) -> Option<u64> {
        self.outputs.get(1).map(|o| o.amount)
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|i| i.outpoint.clone()).collect()
    }

    /// Hex-encoded canonical payload sent to the signing facade
    pub fn to_hex(&self) -> Result<String, serde_json::Error> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }
}

// =============================================================================
// Signed Transaction
// =============================================================================

/// A signed transaction as returned by the signing facade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Operation the unsigned transaction was built for
    pub operation_id: String,
    /// Raw signed transaction bytes, hex encoded
    pub hex: String,
}

impl SignedTransaction {
    pub fn new(operation_id: impl Into<String>, raw: &[u8]) -> Self {
        Self {
            operation_id: operation_id.into(),
            hex: hex::encode(raw),
        }
    }

    /// Whether the payload is non-empty, well-formed hex
    pub fn is_well_formed(&self) -> bool {
        !self.hex.is_empty() && hex::decode(&self.hex).is_ok()
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for unsigned payment transactions
pub struct TransactionBuilder {
    operation_id: Option<String>,
    inputs: Vec<Output>,
    outputs: Vec<TransactionOutput>,
    fee: u64,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            operation_id: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            fee: 0,
        }
    }

    /// Add an input from a resolved output
    pub fn add_input(mut self, output: &Output) -> Self {
        self.inputs.push(output.clone());
        self
    }

    /// Add an output
    pub fn add_output(mut self, recipient: &str, amount: u64) -> Self {
        self.outputs.push(TransactionOutput {
            amount,
            recipient: recipient.to_string(),
        });
        self
    }

    pub fn fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    /// Use an explicit operation id instead of deriving one
    pub fn operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// Build the unsigned transaction
    pub fn build(self) -> UnsignedTransaction {
        let created_at = Utc::now();
        let estimated_size = estimate_tx_size(self.inputs.len(), self.outputs.len());
        let operation_id = self
            .operation_id
            .unwrap_or_else(|| derive_operation_id(&self.inputs, &self.outputs, created_at));

        UnsignedTransaction {
            operation_id,
            inputs: self.inputs,
            outputs: self.outputs,
            fee: self.fee,
            estimated_size,
            created_at,
        }
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_operation_id(
    inputs: &[Output],
    outputs: &[TransactionOutput],
    created_at: DateTime<Utc>,
) -> String {
    let mut data = String::new();
    for input in inputs {
        data.push_str(&input.outpoint.to_string());
        data.push(';');
    }
    for output in outputs {
        data.push_str(&format!("{}={};", output.recipient, output.amount));
    }
    data.push_str(&created_at.timestamp_nanos_opt().unwrap_or_default().to_string());
    sha256_hex(data.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let input = Output::new("tx1", 0, "A", 10_000, 3);
        let tx = TransactionBuilder::new()
            .add_input(&input)
            .add_output("B", 6_000)
            .add_output("A", 1_740)
            .fee(2_260)
            .build();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.estimated_size, 226);
        assert_eq!(tx.total_input(), 10_000);
        assert_eq!(tx.total_output() + tx.fee, 10_000);
        assert_eq!(tx.change(), Some(1_740));
        assert_eq!(tx.operation_id.len(), 64);
    }

    #[test]
    fn test_explicit_operation_id() {
        let tx = TransactionBuilder::new()
            .operation_id("op-1")
            .add_output("B", 1)
            .build();
        assert_eq!(tx.operation_id, "op-1");
        assert_eq!(tx.change(), None);
    }

    #[test]
    fn test_signed_transaction_hex() {
        let signed = SignedTransaction::new("op-1", &[0xde, 0xad]);
        assert_eq!(signed.hex, "dead");
        assert!(signed.is_well_formed());

        let bad = SignedTransaction {
            operation_id: "op-1".into(),
            hex: "zz".into(),
        };
        assert!(!bad.is_well_formed());
    }
}
