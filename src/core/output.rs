//! Output identity and chain-observed output data
//!
//! An [`Output`] is the base spendable unit. Its identity is the
//! [`OutPoint`] `(tx_id, output_index)`; value and confirmation count are
//! snapshots taken from the chain reader on each resolution.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// OutPoint
// =============================================================================

/// Reference to a transaction output: `(tx_id, output_index)`
///
/// Ordering is lexicographic on the transaction id, then the index, which is
/// the tie-break used by coin selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction that created the output
    pub tx_id: String,
    /// Index of the output in that transaction
    pub output_index: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

// =============================================================================
// Output
// =============================================================================

/// Unspent output as reported by the chain reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub outpoint: OutPoint,
    /// Owning address
    pub address: String,
    /// Value in the smallest unit
    pub value: u64,
    /// Confirmation count as last observed
    pub confirmations: u32,
}

impl Output {
    pub fn new(
        tx_id: impl Into<String>,
        output_index: u32,
        address: impl Into<String>,
        value: u64,
        confirmations: u32,
    ) -> Self {
        Self {
            outpoint: OutPoint::new(tx_id, output_index),
            address: address.into(),
            value,
            confirmations,
        }
    }

    /// Check if this output belongs to the given address
    pub fn is_owned_by(&self, address: &str) -> bool {
        self.address == address
    }
}

/// Sort outputs for deterministic coin selection: value descending, then
/// outpoint ascending.
pub fn sort_for_selection(outputs: &mut [Output]) {
    outputs.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });
}

/// Sum of output values
pub fn total_value(outputs: &[Output]) -> u64 {
    outputs.iter().map(|o| o.value).sum()
}
