//! Signing facade boundary
//!
//! The remote signing service is opaque to the engine beyond fail/succeed.
//! Calls are bounded by [`SigningGateway`] the same way chain calls are.

use crate::core::UnsignedTransaction;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Signing facade errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Signer unavailable: {0}")]
    Unavailable(String),
    #[error("Signer timed out after {0:?}")]
    Timeout(Duration),
    #[error("Signer refused: {0}")]
    Refused(String),
}

/// Remote signing facade
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `tx` with the key of `source_address`, returning raw bytes
    async fn sign(
        &self,
        tx: &UnsignedTransaction,
        source_address: &str,
    ) -> Result<Vec<u8>, SignerError>;
}

/// Timeout-bounded handle to a [`Signer`]
#[derive(Clone)]
pub struct SigningGateway {
    signer: Arc<dyn Signer>,
    timeout: Duration,
}

impl SigningGateway {
    pub fn new(signer: Arc<dyn Signer>, timeout: Duration) -> Self {
        Self { signer, timeout }
    }

    pub async fn sign(
        &self,
        tx: &UnsignedTransaction,
        source_address: &str,
    ) -> Result<Vec<u8>, SignerError> {
        match tokio::time::timeout(self.timeout, self.signer.sign(tx, source_address)).await {
            Ok(result) => result,
            Err(_) => Err(SignerError::Timeout(self.timeout)),
        }
    }
}

/// Signer for the in-memory chain: returns the canonical payload untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSigner;

#[async_trait]
impl Signer for PassthroughSigner {
    async fn sign(
        &self,
        tx: &UnsignedTransaction,
        _source_address: &str,
    ) -> Result<Vec<u8>, SignerError> {
        serde_json::to_vec(tx).map_err(|e| SignerError::Refused(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;

    struct StuckSigner;

    #[async_trait]
    impl Signer for StuckSigner {
        async fn sign(&self, _: &UnsignedTransaction, _: &str) -> Result<Vec<u8>, SignerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_passthrough_matches_canonical_hex() {
        let tx = TransactionBuilder::new().add_output("B", 10).build();
        let gateway = SigningGateway::new(Arc::new(PassthroughSigner), Duration::from_secs(1));
        let raw = gateway.sign(&tx, "A").await.unwrap();
        assert_eq!(hex::encode(raw), tx.to_hex().unwrap());
    }

    #[tokio::test]
    async fn test_timeout() {
        let tx = TransactionBuilder::new().add_output("B", 10).build();
        let gateway = SigningGateway::new(Arc::new(StuckSigner), Duration::from_millis(10));
        let err = gateway.sign(&tx, "A").await.unwrap_err();
        assert_eq!(err, SignerError::Timeout(Duration::from_millis(10)));
    }
}
