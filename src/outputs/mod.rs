//! Transaction output tracking
//!
//! - Output ledger (broadcasted / spent records with retention windows)
//! - Unspent output resolver (chain view minus ledger exclusions)

pub mod ledger;
pub mod resolver;

pub use ledger::{OutputLedger, RetentionPolicy, SweepReport};
pub use resolver::UnspentOutputResolver;
