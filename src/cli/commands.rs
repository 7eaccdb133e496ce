//! CLI commands for the settlement service
//!
//! Implements all command handlers for the CLI interface.

use crate::api::{create_router, ApiState, WsBroadcaster};
use crate::chain::{ChainFixture, MemoryChain};
use crate::config::ServiceConfig;
use crate::core::{estimate_tx_size, FeeEstimator, FeeRate};
use crate::outputs::OutputLedger;
use crate::service::{EngineStores, Persistence, SettlementService};
use crate::sign::PassthroughSigner;
use crate::storage::{MemoryBackend, OutputRecord, SpendOrigin, Storage, StorageConfig};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state shared by the offline commands
pub struct AppState {
    pub config: ServiceConfig,
    pub storage: Arc<Storage>,
    pub backend: MemoryBackend,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load config and restore the persisted engine state, if any
    pub async fn new(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> CliResult<Self> {
        let mut config = ServiceConfig::load_or_default(config_path)?;
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }

        let storage_config = StorageConfig {
            data_dir: config.data_dir.clone(),
            ..Default::default()
        };
        let storage = Arc::new(Storage::new(storage_config)?);
        let backend = MemoryBackend::new();

        if storage.exists() {
            println!("📂 Loading state from {:?}...", config.data_dir);
            backend.restore(storage.load()?).await;
        } else {
            println!("🆕 No saved state in {:?}", config.data_dir);
        }

        Ok(Self {
            data_dir: config.data_dir.clone(),
            config,
            storage,
            backend,
        })
    }

    /// Save the current state
    pub async fn save(&self) -> CliResult<()> {
        self.storage.save(&self.backend.snapshot().await)?;
        Ok(())
    }

    fn ledger(&self) -> OutputLedger {
        OutputLedger::new(
            self.backend.broadcasted.clone(),
            self.backend.spent.clone(),
            self.config.retention_policy(),
        )
    }
}

// =============================================================================
// Serve
// =============================================================================

/// Run the API and background tasks against a fixture chain
pub async fn cmd_serve(
    config_path: Option<&Path>,
    data_dir: Option<PathBuf>,
    fixture: Option<&Path>,
    port: Option<u16>,
    block_interval: Option<u64>,
) -> CliResult<()> {
    let mut config = ServiceConfig::load_or_default(config_path)?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = port {
        config.api_port = port;
    }

    let chain = Arc::new(match fixture {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            let fixture: ChainFixture = serde_json::from_str(&data)?;
            println!(
                "⛓️  Loaded chain fixture: height {}, {} outputs",
                fixture.height,
                fixture.outputs.len()
            );
            MemoryChain::from_fixture(&fixture)?
        }
        None => {
            println!("⛓️  Starting with an empty chain");
            MemoryChain::new(0)
        }
    });

    let storage = Arc::new(Storage::new(StorageConfig {
        data_dir: config.data_dir.clone(),
        ..Default::default()
    })?);
    let backend = MemoryBackend::new();
    let persistence = Persistence::new(storage, backend.clone());
    if persistence.restore().await? {
        println!("📂 Restored state from {:?}", config.data_dir);
    }

    let ws_broadcaster = Arc::new(WsBroadcaster::new());
    let api_port = config.api_port;
    let service = Arc::new(SettlementService::new(
        config,
        chain.clone(),
        Arc::new(PassthroughSigner),
        EngineStores::from(&backend),
        ws_broadcaster.clone(),
        Some(persistence),
    )?);
    service.start().await;

    // Advance the fixture chain so confirmations grow while serving
    let miner = block_interval.map(|secs| {
        let chain = chain.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                chain.mine(1).await;
                log::debug!("Fixture chain advanced to height {}", chain.height().await);
            }
        })
    });

    let state = ApiState {
        service: service.clone(),
        ws_broadcaster,
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", api_port);
    println!("🚀 Settlement API listening on http://localhost:{}", api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\n🛑 Shutting down...");
        })
        .await?;

    if let Some(miner) = miner {
        miner.abort();
    }
    service.shutdown().await?;
    println!("💾 State saved");
    Ok(())
}

// =============================================================================
// Offline Commands
// =============================================================================

/// Estimate the fee for a transaction shape
pub fn cmd_fee(
    config_path: Option<&Path>,
    inputs: usize,
    outputs: usize,
    rate: Option<u64>,
) -> CliResult<()> {
    let config = ServiceConfig::load_or_default(config_path)?;
    let estimator: FeeEstimator = config.fee_estimator()?;
    let rate = rate.map(FeeRate::from_per_byte).unwrap_or(estimator.rate());
    let size = estimate_tx_size(inputs, outputs);
    let fee = estimator.estimate(size, rate)?;

    println!("💸 Fee estimate");
    println!("   ├─ Shape: {} input(s), {} output(s)", inputs, outputs);
    println!("   ├─ Size: {} bytes", size);
    println!("   ├─ Rate: {} per byte", rate.as_per_byte());
    println!(
        "   ├─ Bounds: {} - {}",
        estimator.min_fee(),
        estimator.max_fee()
    );
    println!("   └─ Fee: {}", fee);
    Ok(())
}

/// Print the validated configuration as JSON
pub fn cmd_config(config_path: Option<&Path>) -> CliResult<()> {
    let config = ServiceConfig::load_or_default(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Show the persisted output ledger
pub async fn cmd_ledger_show(state: &AppState) -> CliResult<()> {
    let ledger = state.ledger();
    let broadcasted = ledger.broadcasted_records().await?;
    let spent = ledger.spent_records().await?;
    let policy = ledger.policy();

    let stats = state.storage.stats()?;

    println!("📒 Output ledger ({:?})", stats.data_dir);
    println!(
        "   State file: {} bytes, {} backup(s)",
        stats.file_size, stats.backup_count
    );
    println!(
        "   Retention: broadcasted {}d, spent {}d, external spends {}",
        policy.broadcasted.num_days(),
        policy.spent.num_days(),
        if policy.expire_external { "expire" } else { "kept" }
    );

    println!("\n   Broadcasted outputs: {}", broadcasted.len());
    for record in &broadcasted {
        print_record(record);
    }
    println!("\n   Spent outputs: {}", spent.len());
    for record in &spent {
        print_record(record);
    }
    Ok(())
}

/// Expire stale ledger records and save the result
pub async fn cmd_ledger_sweep(state: &AppState) -> CliResult<()> {
    let report = state.ledger().sweep_expired(Utc::now()).await?;
    state.save().await?;

    println!("🧹 Ledger swept");
    println!(
        "   ├─ Expired broadcasts: {}",
        report.expired_broadcasts.len()
    );
    println!("   └─ Expired spent records: {}", report.expired_spent.len());
    for outpoint in report
        .expired_broadcasts
        .iter()
        .chain(report.expired_spent.iter())
    {
        println!("      {}", outpoint);
    }
    Ok(())
}

fn print_record(record: &OutputRecord) {
    let origin = match &record.origin {
        SpendOrigin::Broadcast { tx_id } => format!("tx {}", tx_id),
        SpendOrigin::External => "external".to_string(),
    };
    println!(
        "   {} {} ({}) {} at {}",
        record.outpoint,
        record.address,
        record.value,
        origin,
        record.recorded_at.format("%Y-%m-%d %H:%M:%S")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Output;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_app_state_round_trip() {
        let dir = tempdir().unwrap();
        let state = AppState::new(None, Some(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(state.data_dir, dir.path());

        let output = Output::new("aa", 0, "A", 1_000, 3);
        state.ledger().mark_externally_spent(&output).await.unwrap();
        state.save().await.unwrap();

        let reloaded = AppState::new(None, Some(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(reloaded.ledger().spent_records().await.unwrap().len(), 1);
        cmd_ledger_show(&reloaded).await.unwrap();
        cmd_ledger_sweep(&reloaded).await.unwrap();
    }

    #[test]
    fn test_fee_command() {
        cmd_fee(None, 2, 2, None).unwrap();
        cmd_fee(None, 1, 1, Some(5)).unwrap();
        assert!(cmd_fee(None, 1, 1, Some(0)).is_err());
    }
}
