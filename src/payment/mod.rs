//! Outgoing payments
//!
//! - Builder (greedy output selection, fee, change)
//! - Broadcaster (submit, ledger marking, double-spend rollback)
//! - Reservations and per-address locks shared by both

pub mod broadcast;
pub mod builder;
pub mod reservation;

pub use broadcast::Broadcaster;
pub use builder::{select_outputs, PaymentBuilder, Selection, DEFAULT_DUST_THRESHOLD};
pub use reservation::{AddressLocks, Reservations};
