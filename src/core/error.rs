//! Engine-level error kinds
//!
//! Every caller-facing operation fails with one of these kinds so the caller
//! can decide whether to retry unchanged, retry with an adjusted amount, or
//! abandon the request.

use crate::chain::ChainError;
use crate::core::fee::FeeError;
use crate::sign::SignerError;
use crate::storage::StorageError;
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Chain reader or signing facade unreachable or timed out.
    /// Retryable with backoff; local state is unchanged.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    /// The network rejected a submitted transaction because an input was
    /// already spent. Nothing was written to the ledger.
    #[error("Double spend rejected: {0}")]
    DoubleSpendRejected(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Operation not found: {0}")]
    OperationNotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether retrying the same request unchanged may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::UpstreamUnavailable(_))
    }
}

impl From<ChainError> for EngineError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Unavailable(msg) => EngineError::UpstreamUnavailable(msg),
            ChainError::Timeout(after) => {
                EngineError::UpstreamUnavailable(format!("chain reader timed out after {:?}", after))
            }
            ChainError::DoubleSpend(msg) => EngineError::DoubleSpendRejected(msg),
            ChainError::Rejected(msg) => EngineError::InvalidInput(msg),
            ChainError::AlreadyKnown(tx_id) => EngineError::InvalidInput(format!(
                "transaction {} already known to the network",
                tx_id
            )),
        }
    }
}

impl From<SignerError> for EngineError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Unavailable(msg) => EngineError::UpstreamUnavailable(msg),
            SignerError::Timeout(after) => {
                EngineError::UpstreamUnavailable(format!("signer timed out after {:?}", after))
            }
            SignerError::Refused(msg) => EngineError::InvalidInput(msg),
        }
    }
}

impl From<FeeError> for EngineError {
    fn from(err: FeeError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
