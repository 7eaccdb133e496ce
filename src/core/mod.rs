//! Core engine types
//!
//! This module contains the fundamental building blocks:
//! - Outputs and outpoints (UTXO identity)
//! - Unsigned / signed payment transactions
//! - Fee estimation
//! - Engine error kinds

pub mod error;
pub mod fee;
pub mod hash;
pub mod output;
pub mod transaction;

pub use error::{EngineError, EngineResult};
pub use fee::{estimate_tx_size, FeeError, FeeEstimator, FeeRate};
pub use hash::{double_sha256_hex, sha256_hex, tagged_id};
pub use output::{sort_for_selection, total_value, OutPoint, Output};
pub use transaction::{
    SignedTransaction, TransactionBuilder, TransactionOutput, UnsignedTransaction,
};
