//! Chain reader boundary
//!
//! Read-only query surface over the chain indexer plus its write path for
//! signed transactions. The concrete indexer client lives outside this
//! crate; [`MemoryChain`] is an in-process implementation used by tests and
//! by the fixture-backed `serve` command.
//!
//! Every call made by the engine goes through [`ChainGateway`], which bounds
//! it with a timeout. A timed-out call is reported as unavailable, never as a
//! confirmed success or failure.

pub mod memory;

use crate::core::{OutPoint, Output, TransactionOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::{ChainFixture, FixtureOutput, MemoryChain, MAX_FIXTURE_OUTPUT_INDEX};

/// Chain reader errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chain reader unavailable: {0}")]
    Unavailable(String),
    #[error("Chain reader timed out after {0:?}")]
    Timeout(Duration),
    /// The network already holds this exact transaction
    #[error("Transaction already known: {0}")]
    AlreadyKnown(String),
    #[error("Input already spent: {0}")]
    DoubleSpend(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

/// Transaction detail as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub tx_id: String,
    /// 0 while unconfirmed
    pub confirmations: u32,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TransactionOutput>,
}

/// Query and submit surface of the chain indexer
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Unspent outputs of `address` with at least `min_confirmations`
    async fn get_unspent_outputs(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<Vec<Output>, ChainError>;

    /// Transaction detail, `None` if the indexer does not know it
    async fn get_transaction(&self, tx_id: &str) -> Result<Option<TransactionInfo>, ChainError>;

    /// Current best block height
    async fn get_best_height(&self) -> Result<u64, ChainError>;

    /// Submit a raw signed transaction, returning its id
    async fn submit(&self, raw_hex: &str) -> Result<String, ChainError>;
}

// =============================================================================
// Gateway
// =============================================================================

/// Timeout-bounded handle to a [`ChainReader`]
#[derive(Clone)]
pub struct ChainGateway {
    reader: Arc<dyn ChainReader>,
    timeout: Duration,
}

impl ChainGateway {
    pub fn new(reader: Arc<dyn ChainReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ChainError>
    where
        F: Future<Output = Result<T, ChainError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(self.timeout)),
        }
    }

    pub async fn unspent_outputs(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<Vec<Output>, ChainError> {
        self.bounded(self.reader.get_unspent_outputs(address, min_confirmations))
            .await
    }

    pub async fn transaction(&self, tx_id: &str) -> Result<Option<TransactionInfo>, ChainError> {
        self.bounded(self.reader.get_transaction(tx_id)).await
    }

    pub async fn best_height(&self) -> Result<u64, ChainError> {
        self.bounded(self.reader.get_best_height()).await
    }

    pub async fn submit(&self, raw_hex: &str) -> Result<String, ChainError> {
        self.bounded(self.reader.submit(raw_hex)).await
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_times_out_slow_reader() {
        let chain = Arc::new(MemoryChain::new(100));
        chain.set_latency(Some(Duration::from_millis(200))).await;
        let gateway = ChainGateway::new(chain, Duration::from_millis(20));

        let err = gateway.best_height().await.unwrap_err();
        assert_eq!(err, ChainError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_gateway_passes_through() {
        let chain = Arc::new(MemoryChain::new(42));
        let gateway = ChainGateway::new(chain, Duration::from_secs(1));
        assert_eq!(gateway.best_height().await.unwrap(), 42);
    }
}
