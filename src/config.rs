//! Service configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file is
//! enough. `validate` rejects combinations the engine cannot run with.

use crate::core::{FeeEstimator, FeeRate};
use crate::detector::CashInThresholds;
use crate::outputs::RetentionPolicy;
use crate::payment::DEFAULT_DUST_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Fee rate in smallest units per byte
    pub fee_per_byte: u64,
    pub min_fee: u64,
    pub max_fee: u64,

    pub min_cash_in_confirmations: u32,
    pub min_cash_out_confirmations: u32,
    /// Advisory cash-in threshold, below `min_cash_in_confirmations`
    pub min_cash_in_retry_confirmations: u32,
    /// Confirmations an output needs before payments may spend it
    pub min_spend_confirmations: u32,

    pub broadcasted_outputs_expiration_days: u32,
    pub spent_outputs_expiration_days: u32,
    /// Let externally observed spends expire like our own broadcasts
    pub expire_external_spends: bool,

    pub dust_threshold: u64,
    /// Hot wallets allowed to fund payments; empty allows any source
    pub source_wallets: Vec<String>,
    pub reservation_ttl_secs: u64,
    pub upstream_timeout_secs: u64,

    pub cash_in_poll_secs: u64,
    pub cash_out_poll_secs: u64,
    pub balance_refresh_secs: u64,
    pub ledger_sweep_secs: u64,
    pub detector_concurrency: usize,

    pub api_port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fee_per_byte: 10,
            min_fee: 1_000,
            max_fee: 50_000,
            min_cash_in_confirmations: 6,
            min_cash_out_confirmations: 6,
            min_cash_in_retry_confirmations: 2,
            min_spend_confirmations: 1,
            broadcasted_outputs_expiration_days: 7,
            spent_outputs_expiration_days: 7,
            expire_external_spends: false,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            source_wallets: Vec::new(),
            reservation_ttl_secs: 600,
            upstream_timeout_secs: 10,
            cash_in_poll_secs: 30,
            cash_out_poll_secs: 30,
            balance_refresh_secs: 60,
            ledger_sweep_secs: 3_600,
            detector_concurrency: 4,
            api_port: 3000,
            data_dir: PathBuf::from(".settlement_data"),
        }
    }
}

impl ServiceConfig {
    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Load `path` if given, otherwise the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fee_per_byte == 0 {
            return Err(ConfigError::Invalid("fee_per_byte must be positive".to_string()));
        }
        if self.min_fee > self.max_fee {
            return Err(ConfigError::Invalid(format!(
                "min_fee {} exceeds max_fee {}",
                self.min_fee, self.max_fee
            )));
        }
        if self.min_cash_in_retry_confirmations >= self.min_cash_in_confirmations {
            return Err(ConfigError::Invalid(format!(
                "min_cash_in_retry_confirmations {} must be below min_cash_in_confirmations {}",
                self.min_cash_in_retry_confirmations, self.min_cash_in_confirmations
            )));
        }
        if self.min_cash_out_confirmations == 0 {
            return Err(ConfigError::Invalid(
                "min_cash_out_confirmations must be positive".to_string(),
            ));
        }
        if self.source_wallets.iter().any(|w| w.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "source_wallets must not contain empty addresses".to_string(),
            ));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::Invalid("upstream_timeout_secs must be positive".to_string()));
        }
        let intervals = [
            self.cash_in_poll_secs,
            self.cash_out_poll_secs,
            self.balance_refresh_secs,
            self.ledger_sweep_secs,
        ];
        if intervals.contains(&0) {
            return Err(ConfigError::Invalid("poll intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn fee_estimator(&self) -> Result<FeeEstimator, ConfigError> {
        FeeEstimator::new(FeeRate::from_per_byte(self.fee_per_byte), self.min_fee, self.max_fee)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(
            self.broadcasted_outputs_expiration_days,
            self.spent_outputs_expiration_days,
            self.expire_external_spends,
        )
    }

    pub fn cash_in_thresholds(&self) -> Result<CashInThresholds, ConfigError> {
        CashInThresholds::new(
            self.min_cash_in_retry_confirmations,
            self.min_cash_in_confirmations,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs as i64)
    }
}
