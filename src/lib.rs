//! UTXO Settlement: output lifecycle and settlement detection in Rust
//!
//! This crate tracks unspent outputs for a set of observed wallets and
//! reports when payments settle:
//! - Output ledger of broadcasted / externally spent outputs with retention windows
//! - Unspent output resolution (chain view minus in-flight spends)
//! - Payment building with greedy selection, dust folding and reservations
//! - Idempotent broadcast with double-spend handling
//! - Cash-in and cash-out detectors with at-most-once settlement records
//! - Materialized wallet balances
//! - JSON persistence, REST API and WebSocket settlement feed
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use utxo_settlement::chain::MemoryChain;
//! use utxo_settlement::config::ServiceConfig;
//! use utxo_settlement::detector::LogSink;
//! use utxo_settlement::service::{EngineStores, SettlementService};
//! use utxo_settlement::sign::PassthroughSigner;
//! use utxo_settlement::storage::MemoryBackend;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let chain = Arc::new(MemoryChain::new(100));
//! chain.fund("source", 50_000, 6).await;
//!
//! let backend = MemoryBackend::new();
//! let service = SettlementService::new(
//!     ServiceConfig::default(),
//!     chain.clone(),
//!     Arc::new(PassthroughSigner),
//!     EngineStores::from(&backend),
//!     Arc::new(LogSink),
//!     None,
//! )?;
//!
//! let tx_id = service.send_payment("source", "dest", 10_000).await?;
//! println!("Payment broadcast as {}", tx_id);
//!
//! chain.mine(6).await;
//! let report = service.poll_cash_out().await?;
//! println!("Settled {} payment(s)", report.settled);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod chain;
pub mod cli;
pub mod config;
pub mod core;
pub mod detector;
pub mod outputs;
pub mod payment;
pub mod service;
pub mod sign;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use chain::{ChainReader, MemoryChain};
pub use config::ServiceConfig;
pub use core::{
    EngineError, EngineResult, FeeEstimator, FeeRate, OutPoint, Output, SignedTransaction,
    UnsignedTransaction,
};
pub use detector::{SettlementEvent, SettlementSink};
pub use outputs::{OutputLedger, UnspentOutputResolver};
pub use payment::{Broadcaster, PaymentBuilder};
pub use service::{EngineStores, SettlementService};
pub use sign::Signer;
pub use storage::{MemoryBackend, Storage};
pub use wallet::WalletBalanceService;
