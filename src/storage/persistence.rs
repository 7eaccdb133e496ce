//! Engine state persistence
//!
//! Saves and loads a JSON snapshot of every store. Writes go to a temporary
//! file first and are moved into place with an atomic rename; the previous
//! file is kept as a rotating backup.

use crate::storage::records::{
    ObservedWallet, OutputRecord, PaymentOperation, SettlementRecord, WalletBalance,
};
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

/// Serializable copy of every store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub broadcasted_outputs: Vec<OutputRecord>,
    #[serde(default)]
    pub spent_outputs: Vec<OutputRecord>,
    #[serde(default)]
    pub wallets: Vec<ObservedWallet>,
    #[serde(default)]
    pub balances: Vec<WalletBalance>,
    #[serde(default)]
    pub operations: Vec<PaymentOperation>,
    #[serde(default)]
    pub settlements: Vec<SettlementRecord>,
    pub saved_at: DateTime<Utc>,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub state_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".settlement_data"),
            state_file: "state.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// Snapshot storage manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    fn state_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.state_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.state_file, index))
    }

    /// Save a snapshot to disk
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<(), StorageError> {
        let path = self.state_path();

        if self.config.backup_enabled && path.exists() && self.config.max_backups > 0 {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.state_file));
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, snapshot)?;

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Load the snapshot from disk
    pub fn load(&self) -> Result<StateSnapshot, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(StorageError::InvalidData("State file not found".to_string()));
        }

        let file = fs::File::open(&path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(snapshot)
    }

    /// Check if a saved snapshot exists
    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }
        Ok(())
    }

    /// Load a backup instead of the current snapshot
    pub fn restore_backup(&self, backup_index: usize) -> Result<StateSnapshot, StorageError> {
        let backup_path = self.backup_path(backup_index);
        if !backup_path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                backup_index
            )));
        }

        let file = fs::File::open(&backup_path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.state_path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };

        Ok(StorageStats {
            file_size,
            backup_count: self.list_backups().len(),
            data_dir: self.config.data_dir.clone(),
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub file_size: u64,
    pub backup_count: usize,
    pub data_dir: PathBuf,
}
