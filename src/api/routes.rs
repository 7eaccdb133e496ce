//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use crate::api::websocket::ws_handler;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// JSON 404 for unknown routes
async fn fallback_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(r#"{"kind":"not_found","error":"Not Found"}"#),
    )
        .into_response()
}

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // WebSocket for settlement events
        .route("/ws", get(ws_handler))
        // Wallet observation
        .route(
            "/api/wallets/{address}/observation",
            post(handlers::subscribe_wallet).delete(handlers::unsubscribe_wallet),
        )
        // Balances
        .route("/api/balances", get(handlers::list_balances))
        .route("/api/balances/{address}", get(handlers::get_balance))
        // Payments
        .route("/api/payments/build", post(handlers::build_payment))
        .route("/api/payments/broadcast", post(handlers::broadcast_payment))
        .route("/api/payments/{operation_id}", get(handlers::get_payment))
        // Ledger
        .route("/api/outputs/spent", post(handlers::mark_output_spent))
        .route("/api/ledger/sweep", post(handlers::sweep_ledger))
        .route("/api/settlements", get(handlers::list_settlements))
        .fallback(fallback_handler)
        .with_state(state)
        .layer(cors)
}
