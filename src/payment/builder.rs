//! Payment builder
//!
//! Selects effective unspent outputs of the source address greedily (largest
//! first) until they cover the amount plus a fee that is re-estimated as each
//! input is added. Change below the dust threshold is folded into the fee.
//!
//! Building does not touch the output ledger; the selected outputs are only
//! reserved in memory until the payment is broadcast. When source wallets are
//! configured, payments may only be funded from those addresses.

use crate::core::{
    EngineError, EngineResult, FeeEstimator, Output, TransactionBuilder, UnsignedTransaction,
};
use crate::outputs::UnspentOutputResolver;
use crate::payment::reservation::{AddressLocks, Reservations};
use crate::storage::{OperationStatus, OperationStore, PaymentOperation};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// Default dust threshold (smallest units)
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Payment and change outputs
const PAYMENT_OUTPUTS: usize = 2;

/// Outputs chosen to fund a payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Output>,
    pub covered: u64,
    pub fee: u64,
}

/// Greedy selection over `candidates` in the order given
pub fn select_outputs(
    candidates: &[Output],
    amount: u64,
    fees: &FeeEstimator,
) -> EngineResult<Selection> {
    let mut inputs = Vec::new();
    let mut covered = 0u64;
    let mut fee = fees.estimate_for(1, PAYMENT_OUTPUTS)?;

    for output in candidates {
        inputs.push(output.clone());
        covered = covered.saturating_add(output.value);
        fee = fees.estimate_for(inputs.len(), PAYMENT_OUTPUTS)?;

        let needed = amount
            .checked_add(fee)
            .ok_or_else(|| EngineError::InvalidInput("amount overflows".to_string()))?;
        if covered >= needed {
            return Ok(Selection {
                inputs,
                covered,
                fee,
            });
        }
    }

    Err(EngineError::InsufficientFunds {
        have: covered,
        need: amount.saturating_add(fee),
    })
}

pub struct PaymentBuilder {
    resolver: Arc<UnspentOutputResolver>,
    fees: FeeEstimator,
    operations: Arc<dyn OperationStore>,
    reservations: Arc<Reservations>,
    locks: Arc<AddressLocks>,
    dust_threshold: u64,
    min_confirmations: u32,
    /// Addresses allowed to fund payments, `None` allows any
    source_wallets: Option<HashSet<String>>,
}

impl PaymentBuilder {
    pub fn new(
        resolver: Arc<UnspentOutputResolver>,
        fees: FeeEstimator,
        operations: Arc<dyn OperationStore>,
        reservations: Arc<Reservations>,
        locks: Arc<AddressLocks>,
    ) -> Self {
        Self {
            resolver,
            fees,
            operations,
            reservations,
            locks,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            min_confirmations: 1,
            source_wallets: None,
        }
    }

    pub fn with_dust_threshold(mut self, dust_threshold: u64) -> Self {
        self.dust_threshold = dust_threshold;
        self
    }

    /// Minimum confirmations an output needs to be spent
    pub fn with_min_confirmations(mut self, min_confirmations: u32) -> Self {
        self.min_confirmations = min_confirmations;
        self
    }

    /// Restrict payment sources to `wallets`. An empty list lifts the restriction.
    pub fn with_source_wallets<I>(mut self, wallets: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let wallets: HashSet<String> = wallets.into_iter().collect();
        self.source_wallets = (!wallets.is_empty()).then_some(wallets);
        self
    }

    /// Build an unsigned payment of `amount` from `source` to `destination`
    pub async fn build(
        &self,
        source: &str,
        destination: &str,
        amount: u64,
    ) -> EngineResult<UnsignedTransaction> {
        if source.trim().is_empty() || destination.trim().is_empty() {
            return Err(EngineError::InvalidInput("address must not be empty".to_string()));
        }
        if amount == 0 {
            return Err(EngineError::InvalidInput("amount must be positive".to_string()));
        }
        if let Some(wallets) = &self.source_wallets {
            if !wallets.contains(source) {
                return Err(EngineError::InvalidInput(format!(
                    "{} is not a configured source wallet",
                    source
                )));
            }
        }

        let _guard = self.locks.acquire(source).await;

        let reserved = self.reservations.reserved(Utc::now()).await;
        let candidates: Vec<Output> = self
            .resolver
            .resolve(source, self.min_confirmations)
            .await?
            .into_iter()
            .filter(|o| !reserved.contains(&o.outpoint))
            .collect();

        // funds are checked first so an unaffordable payment reports what is missing
        let selection = select_outputs(&candidates, amount, &self.fees)?;
        if amount < self.dust_threshold {
            return Err(EngineError::InvalidInput(format!(
                "amount {} below dust threshold {}",
                amount, self.dust_threshold
            )));
        }
        let change = selection.covered - amount - selection.fee;

        let mut builder = TransactionBuilder::new().add_output(destination, amount);
        for input in &selection.inputs {
            builder = builder.add_input(input);
        }
        let fee = if change >= self.dust_threshold {
            builder = builder.add_output(source, change);
            selection.fee
        } else {
            selection.fee + change
        };
        let tx = builder.fee(fee).build();

        self.reservations
            .reserve(&tx.operation_id, tx.outpoints())
            .await;
        let operation = PaymentOperation {
            operation_id: tx.operation_id.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            amount,
            fee,
            inputs: tx.inputs.clone(),
            status: OperationStatus::Built,
            created_at: tx.created_at,
            signed_hex: None,
        };
        if let Err(e) = self.operations.upsert(operation).await {
            self.reservations.release(&tx.operation_id).await;
            return Err(e.into());
        }

        log::info!(
            "Built payment {}: {} -> {} amount {} fee {} ({} inputs)",
            tx.operation_id,
            source,
            destination,
            amount,
            fee,
            tx.inputs.len()
        );
        Ok(tx)
    }

    pub fn fees(&self) -> &FeeEstimator {
        &self.fees
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainGateway, MemoryChain};
    use crate::core::FeeRate;
    use crate::outputs::{OutputLedger, RetentionPolicy};
    use crate::storage::{MemoryOperationStore, MemoryOutputRecords};
    use std::time::Duration;

    struct Fixture {
        chain: Arc<MemoryChain>,
        ledger: Arc<OutputLedger>,
        operations: Arc<MemoryOperationStore>,
        builder: Arc<PaymentBuilder>,
    }

    fn fixture() -> Fixture {
        fixture_with_sources(Vec::new())
    }

    fn fixture_with_sources(source_wallets: Vec<String>) -> Fixture {
        let chain = Arc::new(MemoryChain::new(100));
        let ledger = Arc::new(OutputLedger::new(
            Arc::new(MemoryOutputRecords::new()),
            Arc::new(MemoryOutputRecords::new()),
            RetentionPolicy::default(),
        ));
        let resolver = Arc::new(UnspentOutputResolver::new(
            ChainGateway::new(chain.clone(), Duration::from_secs(1)),
            ledger.clone(),
        ));
        let operations = Arc::new(MemoryOperationStore::new());
        let fees = FeeEstimator::new(FeeRate(10), 1_000, 50_000).unwrap();
        let builder = Arc::new(
            PaymentBuilder::new(
                resolver,
                fees,
                operations.clone(),
                Arc::new(Reservations::default()),
                Arc::new(AddressLocks::new()),
            )
            .with_source_wallets(source_wallets),
        );
        Fixture {
            chain,
            ledger,
            operations,
            builder,
        }
    }

    #[tokio::test]
    async fn test_insufficient_funds_when_fee_exceeds_output() {
        let f = fixture();
        f.chain.fund("A", 500, 6).await;

        // 226 bytes at 10/byte = 2260 > 500 - 300
        let err = f.builder.build("A", "B", 300).await.unwrap_err();
        match err {
            EngineError::InsufficientFunds { have, need } => {
                assert_eq!(have, 500);
                assert_eq!(need, 300 + 2_260);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.operations.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_configured_sources_may_pay() {
        let f = fixture_with_sources(vec!["HOT".to_string()]);
        f.chain.fund("HOT", 10_000, 6).await;
        f.chain.fund("CUSTOMER", 10_000, 6).await;

        let err = f.builder.build("CUSTOMER", "B", 5_000).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(f.operations.list().await.unwrap().is_empty());

        let tx = f.builder.build("HOT", "B", 5_000).await.unwrap();
        assert_eq!(tx.inputs[0].address, "HOT");
    }

    #[tokio::test]
    async fn test_build_with_change() {
        let f = fixture();
        let out = f.chain.fund("A", 10_000, 6).await;

        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        assert_eq!(tx.inputs, vec![out]);
        assert_eq!(tx.fee, 2_260);
        assert_eq!(tx.outputs[0].recipient, "B");
        assert_eq!(tx.outputs[0].amount, 6_000);
        assert_eq!(tx.change(), Some(10_000 - 6_000 - 2_260));
        assert_eq!(tx.total_input(), tx.total_output() + tx.fee);

        let op = f.operations.get(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Built);
        // building never writes the ledger
        assert!(f.ledger.broadcasted_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dust_change_folded_into_fee() {
        let f = fixture();
        f.chain.fund("A", 8_400, 6).await;

        let tx = f.builder.build("A", "B", 6_000).await.unwrap();
        // change would be 140, below dust
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.fee, 2_400);
        assert_eq!(tx.total_input(), tx.total_output() + tx.fee);
    }

    #[tokio::test]
    async fn test_fee_grows_with_inputs() {
        let f = fixture();
        f.chain.fund("A", 3_000, 6).await;
        f.chain.fund("A", 3_000, 6).await;
        f.chain.fund("A", 3_000, 6).await;

        let tx = f.builder.build("A", "B", 3_500).await.unwrap();
        assert_eq!(tx.inputs.len(), 3);
        // 10 + 3*148 + 2*34 = 522 bytes, plus 280 dust change
        assert_eq!(tx.fee, 5_220 + 280);
        assert_eq!(tx.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let f = fixture();
        f.chain.fund("A", 5_000, 6).await;
        let big = f.chain.fund("A", 20_000, 6).await;

        let tx = f.builder.build("A", "B", 1_000).await.unwrap();
        assert_eq!(tx.inputs, vec![big]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let f = fixture();
        assert!(matches!(
            f.builder.build("", "B", 1_000).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            f.builder.build("A", "B", 0).await,
            Err(EngineError::InvalidInput(_))
        ));

        // an affordable payment below dust is still refused
        f.chain.fund("A", 10_000, 6).await;
        assert!(matches!(
            f.builder.build("A", "B", 100).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(f.operations.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_builds_do_not_share_outputs() {
        let f = fixture();
        f.chain.fund("A", 10_000, 6).await;

        f.builder.build("A", "B", 6_000).await.unwrap();
        let second = f.builder.build("A", "C", 6_000).await;
        assert!(matches!(second, Err(EngineError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_builds_never_double_allocate() {
        let f = fixture();
        f.chain.fund("A", 10_000, 6).await;
        f.chain.fund("A", 9_000, 6).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let builder = f.builder.clone();
            handles.push(tokio::spawn(async move {
                builder.build("A", &format!("dest{}", i), 6_000).await
            }));
        }

        let mut used = Vec::new();
        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(tx) => {
                    successes += 1;
                    used.extend(tx.outpoints());
                }
                Err(EngineError::InsufficientFunds { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 2);
        let mut deduped = used.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), used.len());
    }

    #[test]
    fn test_select_outputs_exhausted() {
        let fees = FeeEstimator::new(FeeRate(10), 1_000, 50_000).unwrap();
        let candidates = vec![Output::new("t", 0, "A", 500, 6)];
        let err = select_outputs(&candidates, 300, &fees).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds { have: 500, need: 2_560 }
        ));
    }
}
