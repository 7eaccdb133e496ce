//! REST API module
//!
//! HTTP access to the settlement service.
//!
//! # Endpoints
//!
//! ## Wallets
//! - `POST /api/wallets/{address}/observation` - Start observing (409 if already observed)
//! - `DELETE /api/wallets/{address}/observation` - Stop observing (204 if not observed)
//!
//! ## Balances
//! - `GET /api/balances?take=&continuation=` - Page through cached balances
//! - `GET /api/balances/{address}` - Cached balance (404 when zero)
//!
//! ## Payments
//! - `POST /api/payments/build` - Build an unsigned payment
//! - `POST /api/payments/broadcast` - Broadcast a signed payment
//! - `GET /api/payments/{operation_id}` - Operation status
//!
//! ## Ledger
//! - `POST /api/outputs/spent` - Record an externally spent output
//! - `POST /api/ledger/sweep` - Run the expiry sweep now
//! - `GET /api/settlements` - Settlement records
//!
//! ## WebSocket
//! - `GET /ws` - Settlement events as they are delivered

pub mod handlers;
pub mod routes;
pub mod websocket;

pub use handlers::ApiState;
pub use routes::create_router;
pub use websocket::{WsBroadcaster, WsEvent};
