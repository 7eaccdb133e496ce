//! Background tasks run by the settlement service

use crate::chain::ChainGateway;
use crate::core::EngineResult;
use crate::detector::{CashInDetector, CashOutDetector, PeriodicTask, PollReport};
use crate::outputs::{OutputLedger, SweepReport};
use crate::payment::{Broadcaster, Reservations};
use crate::storage::{MemoryBackend, Storage};
use crate::wallet::WalletBalanceService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// Persistence Hook
// =============================================================================

/// Snapshot writer for the in-memory backend
#[derive(Clone)]
pub struct Persistence {
    storage: Arc<Storage>,
    backend: MemoryBackend,
}

impl Persistence {
    pub fn new(storage: Arc<Storage>, backend: MemoryBackend) -> Self {
        Self { storage, backend }
    }

    /// Restore the backend from disk if a snapshot exists
    pub async fn restore(&self) -> EngineResult<bool> {
        if !self.storage.exists() {
            return Ok(false);
        }
        let snapshot = self.storage.load()?;
        log::info!(
            "Restored state saved at {} ({} operations, {} settlements)",
            snapshot.saved_at,
            snapshot.operations.len(),
            snapshot.settlements.len()
        );
        self.backend.restore(snapshot).await;
        Ok(true)
    }

    pub async fn save(&self) -> EngineResult<()> {
        let snapshot = self.backend.snapshot().await;
        self.storage.save(&snapshot)?;
        log::debug!("State saved");
        Ok(())
    }
}

// =============================================================================
// Ledger Maintenance
// =============================================================================

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    pub reconciled: usize,
    pub reservations_expired: usize,
    pub reconcile_failures: usize,
}

/// Expiry sweep plus reconciliation of broadcast records against the chain
pub struct LedgerMaintenance {
    ledger: Arc<OutputLedger>,
    chain: ChainGateway,
    reservations: Arc<Reservations>,
    persistence: Option<Persistence>,
}

impl LedgerMaintenance {
    pub fn new(
        ledger: Arc<OutputLedger>,
        chain: ChainGateway,
        reservations: Arc<Reservations>,
        persistence: Option<Persistence>,
    ) -> Self {
        Self {
            ledger,
            chain,
            reservations,
            persistence,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> EngineResult<MaintenanceReport> {
        let mut report = MaintenanceReport {
            sweep: self.ledger.sweep_expired(now).await?,
            reservations_expired: self.reservations.purge_expired(now).await,
            ..Default::default()
        };

        for address in self.ledger.tracked_addresses().await? {
            let reconciled = match self.chain.unspent_outputs(&address, 0).await {
                Ok(unspent) => self.ledger.reconcile(&address, &unspent, now).await,
                Err(e) => Err(e.into()),
            };
            match reconciled {
                Ok(n) => report.reconciled += n,
                Err(e) => {
                    log::warn!("Ledger reconcile for {} failed: {}", address, e);
                    report.reconcile_failures += 1;
                }
            }
        }

        if let Some(persistence) = &self.persistence {
            persistence.save().await?;
        }

        log::info!(
            "Ledger maintenance: {} broadcasts expired, {} spent expired, {} reconciled",
            report.sweep.expired_broadcasts.len(),
            report.sweep.expired_spent.len(),
            report.reconciled
        );
        Ok(report)
    }
}

// =============================================================================
// Periodic Tasks
// =============================================================================

pub struct CashInTask(pub Arc<CashInDetector>);

#[async_trait]
impl PeriodicTask for CashInTask {
    fn name(&self) -> &'static str {
        "cash-in detector"
    }

    async fn run_once(&self) -> EngineResult<()> {
        self.0.poll().await.map(|_| ())
    }
}

/// Resubmit payments whose broadcast outcome is unknown, then poll cash-outs
pub async fn cash_out_cycle(
    broadcaster: &Broadcaster,
    detector: &CashOutDetector,
) -> EngineResult<PollReport> {
    let resubmitted = match broadcaster.resubmit_pending().await {
        Ok(n) => n,
        Err(e) => {
            log::warn!("Resubmitting pending payments failed: {}", e);
            0
        }
    };
    if resubmitted > 0 {
        log::info!("Resubmitted {} pending payment(s)", resubmitted);
    }
    detector.poll().await
}

pub struct CashOutTask {
    pub broadcaster: Arc<Broadcaster>,
    pub detector: Arc<CashOutDetector>,
}

#[async_trait]
impl PeriodicTask for CashOutTask {
    fn name(&self) -> &'static str {
        "cash-out detector"
    }

    async fn run_once(&self) -> EngineResult<()> {
        cash_out_cycle(&self.broadcaster, &self.detector)
            .await
            .map(|_| ())
    }
}

pub struct BalanceRefreshTask(pub Arc<WalletBalanceService>);

#[async_trait]
impl PeriodicTask for BalanceRefreshTask {
    fn name(&self) -> &'static str {
        "balance refresh"
    }

    async fn run_once(&self) -> EngineResult<()> {
        self.0.refresh_all().await.map(|_| ())
    }
}

pub struct LedgerSweepTask(pub Arc<LedgerMaintenance>);

#[async_trait]
impl PeriodicTask for LedgerSweepTask {
    fn name(&self) -> &'static str {
        "ledger sweep"
    }

    async fn run_once(&self) -> EngineResult<()> {
        self.0.run(Utc::now()).await.map(|_| ())
    }
}
