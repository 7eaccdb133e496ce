//! Wallet balance cache
//!
//! Keeps one balance snapshot per observed wallet, recomputed from the
//! effective unspent set at the cash-in confirmation depth. A wallet with a
//! zero balance has no snapshot at all.

use crate::core::{EngineError, EngineResult};
use crate::outputs::UnspentOutputResolver;
use crate::storage::{BalancePage, BalanceStore, ObservedWallet, WalletBalance, WalletStore};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of refreshing every observed wallet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub updated: usize,
    pub cleared: usize,
    pub failures: usize,
}

pub struct WalletBalanceService {
    wallets: Arc<dyn WalletStore>,
    balances: Arc<dyn BalanceStore>,
    resolver: Arc<UnspentOutputResolver>,
    min_confirmations: u32,
}

impl WalletBalanceService {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        balances: Arc<dyn BalanceStore>,
        resolver: Arc<UnspentOutputResolver>,
        min_confirmations: u32,
    ) -> Self {
        Self {
            wallets,
            balances,
            resolver,
            min_confirmations,
        }
    }

    /// Start observing `address`. Returns false if it was already observed.
    pub async fn subscribe(&self, address: &str) -> EngineResult<bool> {
        validate_address(address)?;
        let added = self
            .wallets
            .insert(ObservedWallet {
                address: address.to_string(),
                subscribed_at: Utc::now(),
            })
            .await?;
        if added {
            log::info!("Observing wallet {}", address);
        }
        Ok(added)
    }

    /// Stop observing `address` and drop its snapshot
    pub async fn unsubscribe(&self, address: &str) -> EngineResult<bool> {
        validate_address(address)?;
        let removed = self.wallets.delete(address).await?;
        self.balances.delete_if_exists(address).await?;
        if removed {
            log::info!("Stopped observing wallet {}", address);
        }
        Ok(removed)
    }

    pub async fn is_observed(&self, address: &str) -> EngineResult<bool> {
        Ok(self.wallets.get(address).await?.is_some())
    }

    /// Recompute the snapshot of an observed wallet. Unobserved wallets are
    /// left alone and yield `None`.
    pub async fn update(&self, address: &str) -> EngineResult<Option<WalletBalance>> {
        if !self.is_observed(address).await? {
            log::debug!("Skipping balance update for unobserved wallet {}", address);
            return Ok(None);
        }

        let balance = self.resolver.balance(address, self.min_confirmations).await?;
        if balance == 0 {
            self.balances.delete_if_exists(address).await?;
            return Ok(None);
        }

        let height = self.resolver.chain().best_height().await?;
        let snapshot = WalletBalance {
            address: address.to_string(),
            balance,
            as_of_block_height: height,
        };
        self.balances.upsert(snapshot.clone()).await?;
        Ok(Some(snapshot))
    }

    pub async fn get(&self, address: &str) -> EngineResult<Option<WalletBalance>> {
        Ok(self.balances.get(address).await?)
    }

    /// Page through stored snapshots ordered by address
    pub async fn list(&self, take: usize, continuation: Option<&str>) -> EngineResult<BalancePage> {
        if take == 0 {
            return Err(EngineError::InvalidInput("take must be positive".to_string()));
        }
        Ok(self.balances.page(take, continuation).await?)
    }

    /// Update every observed wallet, isolating per-wallet failures
    pub async fn refresh_all(&self) -> EngineResult<RefreshReport> {
        let mut report = RefreshReport::default();
        for wallet in self.wallets.list().await? {
            match self.update(&wallet.address).await {
                Ok(Some(_)) => report.updated += 1,
                Ok(None) => report.cleared += 1,
                Err(e) => {
                    log::warn!("Balance refresh for {} failed: {}", wallet.address, e);
                    report.failures += 1;
                }
            }
        }
        log::debug!("Balance refresh: {:?}", report);
        Ok(report)
    }
}

fn validate_address(address: &str) -> EngineResult<()> {
    if address.trim().is_empty() {
        return Err(EngineError::InvalidInput("address must not be empty".to_string()));
    }
    Ok(())
}
