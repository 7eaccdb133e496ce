//! Observed wallets and their cached balances

pub mod balance;

pub use balance::{RefreshReport, WalletBalanceService};
