//! Broadcaster
//!
//! Submits signed payments and records the consumed outputs in the output
//! ledger only once the chain reader has accepted them. A resubmission of a
//! transaction the network already holds counts as success, so retrying
//! after a lost response is safe.
//!
//! The signed bytes are stored on the operation before the first submission.
//! When a later submission with different bytes conflicts, the stored bytes
//! are tried again before the payment is given up, and
//! [`Broadcaster::resubmit_pending`] repeats submissions whose outcome was
//! never learned.

use crate::chain::{ChainError, ChainGateway};
use crate::core::{EngineError, EngineResult, SignedTransaction};
use crate::outputs::OutputLedger;
use crate::payment::reservation::{AddressLocks, Reservations};
use crate::storage::{OperationStatus, OperationStore, PaymentOperation};
use std::sync::Arc;

pub struct Broadcaster {
    chain: ChainGateway,
    ledger: Arc<OutputLedger>,
    operations: Arc<dyn OperationStore>,
    reservations: Arc<Reservations>,
    locks: Arc<AddressLocks>,
}

impl Broadcaster {
    pub fn new(
        chain: ChainGateway,
        ledger: Arc<OutputLedger>,
        operations: Arc<dyn OperationStore>,
        reservations: Arc<Reservations>,
        locks: Arc<AddressLocks>,
    ) -> Self {
        Self {
            chain,
            ledger,
            operations,
            reservations,
            locks,
        }
    }

    /// Submit a signed payment, returning the network transaction id
    pub async fn broadcast(&self, signed: &SignedTransaction) -> EngineResult<String> {
        if !signed.is_well_formed() {
            return Err(EngineError::InvalidInput(format!(
                "malformed transaction for operation {}",
                signed.operation_id
            )));
        }

        let source = self
            .operations
            .get(&signed.operation_id)
            .await?
            .ok_or_else(|| EngineError::OperationNotFound(signed.operation_id.clone()))?
            .source;
        let _guard = self.locks.acquire(&source).await;

        // re-read under the lock, a concurrent broadcast may have finished
        let mut operation = self
            .operations
            .get(&signed.operation_id)
            .await?
            .ok_or_else(|| EngineError::OperationNotFound(signed.operation_id.clone()))?;
        if let OperationStatus::Completed { tx_id } = &operation.status {
            return Ok(tx_id.clone());
        }

        let previous_hex = operation.signed_hex.clone();
        if previous_hex.is_none() {
            operation.signed_hex = Some(signed.hex.clone());
            self.operations.upsert(operation.clone()).await?;
        }

        let (tx_id, accepted_hex) = match self.submit(&signed.hex).await {
            Ok(tx_id) => (tx_id, signed.hex.clone()),
            Err(ChainError::DoubleSpend(detail)) => {
                self.resolve_conflict(&operation, previous_hex, &signed.hex, detail)
                    .await?
            }
            Err(e) => {
                log::warn!("Broadcast of {} failed: {}", operation.operation_id, e);
                return Err(e.into());
            }
        };

        self.ledger.mark_broadcasted(&operation.inputs, &tx_id).await?;
        let status = OperationStatus::Broadcasted {
            tx_id: tx_id.clone(),
        };
        if operation.status != status || operation.signed_hex.as_ref() != Some(&accepted_hex) {
            operation.status = status;
            operation.signed_hex = Some(accepted_hex);
            self.operations.upsert(operation.clone()).await?;
        }
        self.reservations.release(&operation.operation_id).await;

        log::info!(
            "Broadcast payment {} as {} ({} inputs marked)",
            operation.operation_id,
            tx_id,
            operation.inputs.len()
        );
        Ok(tx_id)
    }

    /// Repeat the stored submission of every signed payment that was never
    /// confirmed as accepted. Returns how many are now broadcast.
    pub async fn resubmit_pending(&self) -> EngineResult<usize> {
        let pending: Vec<PaymentOperation> = self
            .operations
            .list()
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Built && op.signed_hex.is_some())
            .collect();

        let mut accepted = 0;
        for operation in pending {
            let Some(hex) = operation.signed_hex else {
                continue;
            };
            // hold the inputs again, the original reservation may have lapsed
            let outpoints = operation.inputs.iter().map(|o| o.outpoint.clone()).collect();
            self.reservations
                .reserve(&operation.operation_id, outpoints)
                .await;
            let signed = SignedTransaction {
                operation_id: operation.operation_id,
                hex,
            };
            match self.broadcast(&signed).await {
                Ok(_) => accepted += 1,
                Err(e) => log::warn!("Resubmission of {} failed: {}", signed.operation_id, e),
            }
        }
        Ok(accepted)
    }

    async fn submit(&self, hex: &str) -> Result<String, ChainError> {
        match self.chain.submit(hex).await {
            Err(ChainError::AlreadyKnown(tx_id)) => {
                log::debug!("Transaction {} already known, treating as accepted", tx_id);
                Ok(tx_id)
            }
            other => other,
        }
    }

    /// Decide what a double-spend rejection means for `operation`.
    ///
    /// A payment already accepted under another signature keeps its state. A
    /// payment whose earlier bytes may have landed retries those bytes. Only
    /// a payment with no accepted transaction is dropped and its outputs
    /// released.
    async fn resolve_conflict(
        &self,
        operation: &PaymentOperation,
        previous_hex: Option<String>,
        hex: &str,
        detail: String,
    ) -> EngineResult<(String, String)> {
        if let Some(tx_id) = operation.tx_id() {
            log::warn!(
                "Payment {} already broadcast as {}, conflicting resubmission refused ({})",
                operation.operation_id,
                tx_id,
                detail
            );
            return Err(EngineError::DoubleSpendRejected(detail));
        }

        if let Some(previous) = previous_hex.filter(|p| p != hex) {
            match self.submit(&previous).await {
                Ok(tx_id) => {
                    log::info!(
                        "Payment {} was already accepted as {} under its earlier signature",
                        operation.operation_id,
                        tx_id
                    );
                    return Ok((tx_id, previous));
                }
                Err(ChainError::DoubleSpend(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.reservations.release(&operation.operation_id).await;
        self.operations.delete(&operation.operation_id).await?;
        log::warn!(
            "Payment {} rejected as double spend ({}), outputs released",
            operation.operation_id,
            detail
        );
        Err(EngineError::DoubleSpendRejected(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::core::{double_sha256_hex, FeeEstimator, FeeRate, UnsignedTransaction};
    use crate::outputs::{RetentionPolicy, UnspentOutputResolver};
    use crate::payment::builder::PaymentBuilder;
    use crate::storage::{MemoryOperationStore, MemoryOutputRecords};
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<MemoryChain>,
        ledger: Arc<OutputLedger>,
        operations: Arc<MemoryOperationStore>,
        reservations: Arc<Reservations>,
        builder: PaymentBuilder,
        broadcaster: Broadcaster,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new(100));
        let gateway = ChainGateway::new(chain.clone(), Duration::from_secs(1));
        let ledger = Arc::new(OutputLedger::new(
            Arc::new(MemoryOutputRecords::new()),
            Arc::new(MemoryOutputRecords::new()),
            RetentionPolicy::default(),
        ));
        let resolver = Arc::new(UnspentOutputResolver::new(gateway.clone(), ledger.clone()));
        let operations = Arc::new(MemoryOperationStore::new());
        let reservations = Arc::new(Reservations::default());
        let locks = Arc::new(AddressLocks::new());
        let fees = FeeEstimator::new(FeeRate(10), 1_000, 50_000).unwrap();

        let builder = PaymentBuilder::new(
            resolver,
            fees,
            operations.clone(),
            reservations.clone(),
            locks.clone(),
        );
        let broadcaster = Broadcaster::new(
            gateway,
            ledger.clone(),
            operations.clone(),
            reservations.clone(),
            locks,
        );
        Fixture {
            chain,
            ledger,
            operations,
            reservations,
            builder,
            broadcaster,
        }
    }

    fn sign(tx: &UnsignedTransaction) -> SignedTransaction {
        SignedTransaction::new(tx.operation_id.clone(), &serde_json::to_vec(tx).unwrap())
    }

    #[tokio::test]
    async fn test_broadcast_marks_inputs() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();

        let tx_id = f.broadcaster.broadcast(&sign(&tx)).await.unwrap();
        assert!(f.chain.contains(&tx_id).await);
        assert!(f.ledger.is_excluded(&out.outpoint).await.unwrap());
        assert!(f.reservations.reserved(Utc::now()).await.is_empty());

        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Broadcasted { tx_id });
    }

    #[tokio::test]
    async fn test_retry_after_lost_response() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        let signed = sign(&tx);

        f.chain.drop_next_submit_response().await;
        let err = f.broadcaster.broadcast(&signed).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
        // outputs stay reserved so nothing else can pick them
        assert!(f.reservations.reserved(Utc::now()).await.contains(&out.outpoint));

        let tx_id = f.broadcaster.broadcast(&signed).await.unwrap();
        assert!(f.chain.contains(&tx_id).await);
        assert_eq!(f.ledger.broadcasted_records().await.unwrap().len(), 1);

        // a third call is still a no-op success
        assert_eq!(f.broadcaster.broadcast(&signed).await.unwrap(), tx_id);
    }

    #[tokio::test]
    async fn test_double_spend_rejected() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        f.chain.spend_externally(&out.outpoint).await;

        let err = f.broadcaster.broadcast(&sign(&tx)).await.unwrap_err();
        assert!(matches!(err, EngineError::DoubleSpendRejected(_)));
        assert!(f.ledger.broadcasted_records().await.unwrap().is_empty());
        assert!(f.reservations.reserved(Utc::now()).await.is_empty());
        assert!(f.operations.get(&tx.operation_id).await.unwrap().is_none());
    }

    /// Same payment, different signature bytes
    fn resign(tx: &UnsignedTransaction) -> SignedTransaction {
        SignedTransaction::new(
            tx.operation_id.clone(),
            &serde_json::to_vec_pretty(tx).unwrap(),
        )
    }

    fn tx_id_of(signed: &SignedTransaction) -> String {
        double_sha256_hex(&hex::decode(&signed.hex).unwrap())
    }

    #[tokio::test]
    async fn test_resigned_retry_keeps_accepted_payment() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        let signed = sign(&tx);
        let tx_id = f.broadcaster.broadcast(&signed).await.unwrap();

        let err = f.broadcaster.broadcast(&resign(&tx)).await.unwrap_err();
        assert!(matches!(err, EngineError::DoubleSpendRejected(_)));

        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Broadcasted { tx_id: tx_id.clone() });
        assert_eq!(op.signed_hex, Some(signed.hex.clone()));
        assert!(f.ledger.is_excluded(&out.outpoint).await.unwrap());
        assert!(f.chain.contains(&tx_id).await);
    }

    #[tokio::test]
    async fn test_resigned_retry_after_lost_response_recovers() {
        let f = fixture();
        f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        let signed = sign(&tx);

        f.chain.drop_next_submit_response().await;
        assert!(f.broadcaster.broadcast(&signed).await.is_err());
        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Built);
        assert_eq!(op.signed_hex, Some(signed.hex.clone()));

        // the first bytes landed, so the new signature conflicts with them
        let tx_id = f.broadcaster.broadcast(&resign(&tx)).await.unwrap();
        assert_eq!(tx_id, tx_id_of(&signed));
        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Broadcasted { tx_id });
        assert_eq!(f.ledger.broadcasted_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmit_pending_after_lost_response() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        let signed = sign(&tx);

        f.chain.drop_next_submit_response().await;
        assert!(f.broadcaster.broadcast(&signed).await.is_err());

        assert_eq!(f.broadcaster.resubmit_pending().await.unwrap(), 1);
        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(
            op.status,
            OperationStatus::Broadcasted {
                tx_id: tx_id_of(&signed)
            }
        );
        assert!(f.ledger.is_excluded(&out.outpoint).await.unwrap());
        assert!(f.reservations.reserved(Utc::now()).await.is_empty());

        // nothing left to resubmit
        assert_eq!(f.broadcaster.resubmit_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let f = fixture();
        let signed = SignedTransaction::new("missing", b"{}");
        assert!(matches!(
            f.broadcaster.broadcast(&signed).await,
            Err(EngineError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_hex() {
        let f = fixture();
        let signed = SignedTransaction {
            operation_id: "op".to_string(),
            hex: "zz".to_string(),
        };
        assert!(matches!(
            f.broadcaster.broadcast(&signed).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_outage_leaves_no_partial_state() {
        let f = fixture();
        f.chain.fund("A", 10_000, 6).await;
        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        f.chain.set_unavailable(true).await;

        assert!(f.broadcaster.broadcast(&sign(&tx)).await.is_err());
        assert!(f.ledger.broadcasted_records().await.unwrap().is_empty());
        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Built);
    }
}
