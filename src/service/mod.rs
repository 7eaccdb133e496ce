//! Settlement service
//!
//! Composition root: builds every component from the configuration, the
//! chain reader, the signer, the stores and the settlement sink, and owns
//! the background tasks. Callers (the REST API, the CLI) only talk to
//! [`SettlementService`].

pub mod tasks;

use crate::chain::{ChainGateway, ChainReader};
use crate::config::{ConfigError, ServiceConfig};
use crate::core::{EngineResult, Output, SignedTransaction, UnsignedTransaction};
use crate::detector::{
    spawn_periodic, CashInDetector, CashOutDetector, PollReport, SettlementSink,
};
use crate::outputs::{OutputLedger, UnspentOutputResolver};
use crate::payment::{AddressLocks, Broadcaster, PaymentBuilder, Reservations};
use crate::sign::{Signer, SigningGateway};
use crate::storage::{
    BalancePage, BalanceStore, MemoryBackend, OperationStore, OutputRecordStore,
    PaymentOperation, SettlementRecord, SettlementStore, WalletBalance, WalletStore,
};
use crate::wallet::{RefreshReport, WalletBalanceService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub use tasks::{
    BalanceRefreshTask, CashInTask, CashOutTask, LedgerMaintenance, LedgerSweepTask,
    MaintenanceReport, Persistence,
};

/// Every store the engine needs
#[derive(Clone)]
pub struct EngineStores {
    pub broadcasted: Arc<dyn OutputRecordStore>,
    pub spent: Arc<dyn OutputRecordStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub balances: Arc<dyn BalanceStore>,
    pub operations: Arc<dyn OperationStore>,
    pub settlements: Arc<dyn SettlementStore>,
}

impl From<&MemoryBackend> for EngineStores {
    fn from(backend: &MemoryBackend) -> Self {
        Self {
            broadcasted: backend.broadcasted.clone(),
            spent: backend.spent.clone(),
            wallets: backend.wallets.clone(),
            balances: backend.balances.clone(),
            operations: backend.operations.clone(),
            settlements: backend.settlements.clone(),
        }
    }
}

pub struct SettlementService {
    config: ServiceConfig,
    ledger: Arc<OutputLedger>,
    resolver: Arc<UnspentOutputResolver>,
    builder: Arc<PaymentBuilder>,
    broadcaster: Arc<Broadcaster>,
    signer: SigningGateway,
    reservations: Arc<Reservations>,
    balances: Arc<WalletBalanceService>,
    cash_in: Arc<CashInDetector>,
    cash_out: Arc<CashOutDetector>,
    maintenance: Arc<LedgerMaintenance>,
    operations: Arc<dyn OperationStore>,
    settlements: Arc<dyn SettlementStore>,
    persistence: Option<Persistence>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SettlementService {
    pub fn new(
        config: ServiceConfig,
        chain: Arc<dyn ChainReader>,
        signer: Arc<dyn Signer>,
        stores: EngineStores,
        sink: Arc<dyn SettlementSink>,
        persistence: Option<Persistence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.upstream_timeout();
        let chain = ChainGateway::new(chain, timeout);

        let ledger = Arc::new(OutputLedger::new(
            stores.broadcasted,
            stores.spent,
            config.retention_policy(),
        ));
        let resolver = Arc::new(UnspentOutputResolver::new(chain.clone(), ledger.clone()));
        let reservations = Arc::new(Reservations::new(config.reservation_ttl()));
        let locks = Arc::new(AddressLocks::new());

        let builder = Arc::new(
            PaymentBuilder::new(
                resolver.clone(),
                config.fee_estimator()?,
                stores.operations.clone(),
                reservations.clone(),
                locks.clone(),
            )
            .with_dust_threshold(config.dust_threshold)
            .with_min_confirmations(config.min_spend_confirmations)
            .with_source_wallets(config.source_wallets.iter().cloned()),
        );
        let broadcaster = Arc::new(Broadcaster::new(
            chain.clone(),
            ledger.clone(),
            stores.operations.clone(),
            reservations.clone(),
            locks,
        ));

        let balances = Arc::new(WalletBalanceService::new(
            stores.wallets.clone(),
            stores.balances,
            resolver.clone(),
            config.min_cash_in_confirmations,
        ));
        let cash_in = Arc::new(
            CashInDetector::new(
                chain.clone(),
                stores.wallets,
                stores.operations.clone(),
                stores.settlements.clone(),
                sink.clone(),
                config.cash_in_thresholds()?,
            )
            .with_concurrency(config.detector_concurrency),
        );
        let cash_out = Arc::new(
            CashOutDetector::new(
                chain.clone(),
                stores.operations.clone(),
                stores.settlements.clone(),
                sink,
                config.min_cash_out_confirmations,
            )
            .with_concurrency(config.detector_concurrency),
        );
        let maintenance = Arc::new(LedgerMaintenance::new(
            ledger.clone(),
            chain,
            reservations.clone(),
            persistence.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            signer: SigningGateway::new(signer, timeout),
            config,
            ledger,
            resolver,
            builder,
            broadcaster,
            reservations,
            balances,
            cash_in,
            cash_out,
            maintenance,
            operations: stores.operations,
            settlements: stores.settlements,
            persistence,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Wallets and Balances
    // =========================================================================

    pub async fn subscribe_wallet(&self, address: &str) -> EngineResult<bool> {
        self.balances.subscribe(address).await
    }

    pub async fn unsubscribe_wallet(&self, address: &str) -> EngineResult<bool> {
        self.balances.unsubscribe(address).await
    }

    pub async fn get_wallet_balance(&self, address: &str) -> EngineResult<Option<WalletBalance>> {
        self.balances.get(address).await
    }

    pub async fn list_wallet_balances(
        &self,
        take: usize,
        continuation: Option<&str>,
    ) -> EngineResult<BalancePage> {
        self.balances.list(take, continuation).await
    }

    pub async fn update_wallet_balance(&self, address: &str) -> EngineResult<Option<WalletBalance>> {
        self.balances.update(address).await
    }

    /// Spendable outputs of `address` as the builder would see them
    pub async fn spendable_outputs(&self, address: &str) -> EngineResult<Vec<Output>> {
        self.resolver
            .resolve(address, self.config.min_spend_confirmations)
            .await
    }

    // =========================================================================
    // Payments
    // =========================================================================

    pub async fn build_payment(
        &self,
        source: &str,
        destination: &str,
        amount: u64,
    ) -> EngineResult<UnsignedTransaction> {
        self.builder.build(source, destination, amount).await
    }

    pub async fn broadcast_payment(&self, signed: &SignedTransaction) -> EngineResult<String> {
        self.broadcaster.broadcast(signed).await
    }

    /// Build, sign and broadcast in one call.
    ///
    /// When the submission outcome is unknown the operation keeps its signed
    /// payload and is resubmitted by the next cash-out cycle.
    pub async fn send_payment(
        &self,
        source: &str,
        destination: &str,
        amount: u64,
    ) -> EngineResult<String> {
        let tx = self.builder.build(source, destination, amount).await?;
        let raw = match self.signer.sign(&tx, source).await {
            Ok(raw) => raw,
            Err(e) => {
                // nothing was submitted, the outputs can go back
                self.reservations.release(&tx.operation_id).await;
                self.operations.delete(&tx.operation_id).await?;
                log::warn!("Signing of {} failed: {}", tx.operation_id, e);
                return Err(e.into());
            }
        };
        self.broadcaster
            .broadcast(&SignedTransaction::new(tx.operation_id, &raw))
            .await
    }

    pub async fn operation(&self, operation_id: &str) -> EngineResult<Option<PaymentOperation>> {
        Ok(self.operations.get(operation_id).await?)
    }

    /// Record an output as spent by a transaction built elsewhere
    pub async fn mark_externally_spent(&self, output: &Output) -> EngineResult<bool> {
        self.ledger.mark_externally_spent(output).await
    }

    pub async fn settlements(&self) -> EngineResult<Vec<SettlementRecord>> {
        Ok(self.settlements.list().await?)
    }

    pub fn ledger(&self) -> &Arc<OutputLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // =========================================================================
    // Background Work
    // =========================================================================

    pub async fn poll_cash_in(&self) -> EngineResult<PollReport> {
        self.cash_in.poll().await
    }

    pub async fn poll_cash_out(&self) -> EngineResult<PollReport> {
        tasks::cash_out_cycle(&self.broadcaster, &self.cash_out).await
    }

    pub async fn refresh_balances(&self) -> EngineResult<RefreshReport> {
        self.balances.refresh_all().await
    }

    pub async fn run_maintenance(&self) -> EngineResult<MaintenanceReport> {
        self.maintenance.run(Utc::now()).await
    }

    /// Spawn the periodic detector, balance and ledger tasks
    pub async fn start(&self) {
        let secs = Duration::from_secs;
        let config = &self.config;
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            log::warn!("Background tasks already running");
            return;
        }

        tasks.push(spawn_periodic(
            Arc::new(CashInTask(self.cash_in.clone())),
            secs(config.cash_in_poll_secs),
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_periodic(
            Arc::new(CashOutTask {
                broadcaster: self.broadcaster.clone(),
                detector: self.cash_out.clone(),
            }),
            secs(config.cash_out_poll_secs),
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_periodic(
            Arc::new(BalanceRefreshTask(self.balances.clone())),
            secs(config.balance_refresh_secs),
            self.shutdown.subscribe(),
        ));
        tasks.push(spawn_periodic(
            Arc::new(LedgerSweepTask(self.maintenance.clone())),
            secs(config.ledger_sweep_secs),
            self.shutdown.subscribe(),
        ));
        log::info!("Started {} background tasks", tasks.len());
    }

    /// Stop background tasks and save state
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Background task ended abnormally: {}", e);
            }
        }
        if let Some(persistence) = &self.persistence {
            persistence.save().await?;
        }
        log::info!("Settlement service stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::core::EngineError;
    use crate::detector::testing::CollectingSink;
    use crate::sign::{PassthroughSigner, SignerError};
    use crate::storage::{OperationStatus, SettlementKind, SettlementStage};
    use async_trait::async_trait;

    struct RefusingSigner;

    #[async_trait]
    impl Signer for RefusingSigner {
        async fn sign(&self, _: &UnsignedTransaction, _: &str) -> Result<Vec<u8>, SignerError> {
            Err(SignerError::Refused("no key".to_string()))
        }
    }

    fn service_with(
        signer: Arc<dyn Signer>,
    ) -> (Arc<MemoryChain>, Arc<CollectingSink>, SettlementService) {
        let chain = Arc::new(MemoryChain::new(100));
        let sink = Arc::new(CollectingSink::default());
        let config = ServiceConfig {
            min_cash_out_confirmations: 2,
            ..Default::default()
        };
        let service = SettlementService::new(
            config,
            chain.clone(),
            signer,
            EngineStores::from(&MemoryBackend::new()),
            sink.clone(),
            None,
        )
        .unwrap();
        (chain, sink, service)
    }

    #[tokio::test]
    async fn test_send_payment_end_to_end() {
        let (chain, sink, service) = service_with(Arc::new(PassthroughSigner));
        chain.fund("A", 20_000, 6).await;
        service.subscribe_wallet("B").await.unwrap();

        let tx_id = service.send_payment("A", "B", 5_000).await.unwrap();
        assert!(chain.contains(&tx_id).await);
        assert!(service.spendable_outputs("A").await.unwrap().is_empty());

        chain.mine(6).await;
        service.poll_cash_out().await.unwrap();
        service.poll_cash_in().await.unwrap();

        assert_eq!(sink.count(SettlementKind::CashOut, SettlementStage::Final).await, 1);
        assert_eq!(sink.count(SettlementKind::CashIn, SettlementStage::Final).await, 1);

        service.refresh_balances().await.unwrap();
        let balance = service.get_wallet_balance("B").await.unwrap().unwrap();
        assert_eq!(balance.balance, 5_000);
    }

    #[tokio::test]
    async fn test_signing_failure_releases_outputs() {
        let (chain, _, service) = service_with(Arc::new(RefusingSigner));
        chain.fund("A", 20_000, 6).await;

        let err = service.send_payment("A", "B", 5_000).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        // outputs are free for the next attempt
        let tx = service.build_payment("A", "B", 5_000).await.unwrap();
        let op = service.operation(&tx.operation_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Built);
    }

    #[tokio::test]
    async fn test_lost_submit_response_recovered_by_cash_out_cycle() {
        let (chain, sink, service) = service_with(Arc::new(PassthroughSigner));
        chain.fund("A", 20_000, 6).await;
        chain.drop_next_submit_response().await;

        let err = service.send_payment("A", "B", 5_000).await.unwrap_err();
        assert!(err.is_retryable());
        let pending = service.operations.list().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OperationStatus::Built);
        assert!(pending[0].signed_hex.is_some());

        chain.mine(6).await;
        let report = service.poll_cash_out().await.unwrap();
        assert_eq!(report.settled, 1);

        let op = service
            .operation(&pending[0].operation_id)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(op.status, OperationStatus::Completed { .. }));
        assert_eq!(service.ledger().broadcasted_records().await.unwrap().len(), 1);
        assert_eq!(sink.count(SettlementKind::CashOut, SettlementStage::Final).await, 1);
    }

    #[tokio::test]
    async fn test_unlisted_source_rejected() {
        let chain = Arc::new(MemoryChain::new(100));
        chain.fund("customer", 20_000, 6).await;
        let config = ServiceConfig {
            source_wallets: vec!["hot".to_string()],
            ..Default::default()
        };
        let service = SettlementService::new(
            config,
            chain,
            Arc::new(PassthroughSigner),
            EngineStores::from(&MemoryBackend::new()),
            Arc::new(CollectingSink::default()),
            None,
        )
        .unwrap();

        let err = service.send_payment("customer", "B", 5_000).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServiceConfig {
            min_fee: 100_000,
            ..Default::default()
        };
        let result = SettlementService::new(
            config,
            Arc::new(MemoryChain::new(1)),
            Arc::new(PassthroughSigner),
            EngineStores::from(&MemoryBackend::new()),
            Arc::new(CollectingSink::default()),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (_, _, service) = service_with(Arc::new(PassthroughSigner));
        service.start().await;
        service.start().await;
        assert_eq!(service.tasks.lock().await.len(), 4);

        service.shutdown().await.unwrap();
        assert!(service.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_externally_spent_excludes_output() {
        let (chain, _, service) = service_with(Arc::new(PassthroughSigner));
        let out = chain.fund("A", 20_000, 6).await;

        assert!(service.mark_externally_spent(&out).await.unwrap());
        assert!(matches!(
            service.build_payment("A", "B", 5_000).await,
            Err(EngineError::InsufficientFunds { .. })
        ));
    }
}
