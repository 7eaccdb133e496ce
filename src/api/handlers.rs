//! REST API handlers for the settlement service

use crate::api::websocket::WsBroadcaster;
use crate::core::{EngineError, Output, SignedTransaction, UnsignedTransaction};
use crate::service::{MaintenanceReport, SettlementService};
use crate::storage::{BalancePage, PaymentOperation, SettlementRecord, WalletBalance};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default and maximum page size for balance listing
const DEFAULT_TAKE: usize = 100;
const MAX_TAKE: usize = 1_000;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<SettlementService>,
    pub ws_broadcaster: Arc<WsBroadcaster>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize, Debug)]
pub struct ObservationResponse {
    pub address: String,
    pub observed: bool,
}

#[derive(Serialize, Debug)]
pub struct BuildResponse {
    pub operation_id: String,
    pub fee: u64,
    pub change: Option<u64>,
    /// Payload handed to the signer
    pub transaction_hex: String,
    pub transaction: UnsignedTransaction,
}

#[derive(Serialize, Debug)]
pub struct BroadcastResponse {
    pub operation_id: String,
    pub tx_id: String,
}

#[derive(Serialize, Debug)]
pub struct SpentResponse {
    pub outpoint: String,
    pub recorded: bool,
}

#[derive(Serialize, Debug)]
pub struct ApiError {
    /// Machine-readable error kind
    pub kind: &'static str,
    pub error: String,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

impl From<EngineError> for (StatusCode, Json<ApiError>) {
    fn from(e: EngineError) -> Self {
        let (status, kind) = match &e {
            EngineError::UpstreamUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            EngineError::InsufficientFunds { .. } => (StatusCode::BAD_REQUEST, "insufficient_funds"),
            EngineError::DoubleSpendRejected(_) => (StatusCode::CONFLICT, "double_spend_rejected"),
            EngineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            EngineError::OperationNotFound(_) => (StatusCode::NOT_FOUND, "operation_not_found"),
            EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", e);
        }
        (
            status,
            Json(ApiError {
                kind,
                error: e.to_string(),
            }),
        )
    }
}

fn not_found(kind: &'static str, error: String) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError { kind, error }))
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
pub struct BalanceQuery {
    pub take: Option<usize>,
    pub continuation: Option<String>,
}

#[derive(Deserialize)]
pub struct BuildPaymentRequest {
    pub source: String,
    pub destination: String,
    pub amount: u64,
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub operation_id: String,
    pub hex: String,
}

#[derive(Deserialize)]
pub struct SpentOutputRequest {
    pub tx_id: String,
    pub output_index: u32,
    pub address: String,
    pub value: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /api/wallets/{address}/observation - Start observing a wallet
pub async fn subscribe_wallet(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<(StatusCode, Json<ObservationResponse>), (StatusCode, Json<ApiError>)> {
    let added = state.service.subscribe_wallet(&address).await?;
    let status = if added {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((
        status,
        Json(ObservationResponse {
            address,
            observed: true,
        }),
    ))
}

/// DELETE /api/wallets/{address}/observation - Stop observing a wallet
pub async fn unsubscribe_wallet(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<(StatusCode, Json<ObservationResponse>), (StatusCode, Json<ApiError>)> {
    let removed = state.service.unsubscribe_wallet(&address).await?;
    let status = if removed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((
        status,
        Json(ObservationResponse {
            address,
            observed: false,
        }),
    ))
}

/// GET /api/balances - Page through cached balances
pub async fn list_balances(
    State(state): State<ApiState>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<BalancePage> {
    let take = query.take.unwrap_or(DEFAULT_TAKE).min(MAX_TAKE);
    let page = state
        .service
        .list_wallet_balances(take, query.continuation.as_deref())
        .await?;
    Ok(Json(page))
}

/// GET /api/balances/{address} - Cached balance of one wallet
pub async fn get_balance(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> ApiResult<WalletBalance> {
    match state.service.get_wallet_balance(&address).await? {
        Some(balance) => Ok(Json(balance)),
        None => Err(not_found(
            "balance_not_found",
            format!("No balance for {}", address),
        )),
    }
}

/// POST /api/payments/build - Build an unsigned payment
pub async fn build_payment(
    State(state): State<ApiState>,
    Json(req): Json<BuildPaymentRequest>,
) -> ApiResult<BuildResponse> {
    let tx = state
        .service
        .build_payment(&req.source, &req.destination, req.amount)
        .await?;
    let transaction_hex = tx
        .to_hex()
        .map_err(|e| EngineError::InvalidInput(format!("unencodable transaction: {}", e)))?;

    Ok(Json(BuildResponse {
        operation_id: tx.operation_id.clone(),
        fee: tx.fee,
        change: tx.change(),
        transaction_hex,
        transaction: tx,
    }))
}

/// POST /api/payments/broadcast - Submit a signed payment
pub async fn broadcast_payment(
    State(state): State<ApiState>,
    Json(req): Json<BroadcastRequest>,
) -> ApiResult<BroadcastResponse> {
    let signed = SignedTransaction {
        operation_id: req.operation_id,
        hex: req.hex,
    };
    let tx_id = state.service.broadcast_payment(&signed).await?;
    Ok(Json(BroadcastResponse {
        operation_id: signed.operation_id,
        tx_id,
    }))
}

/// GET /api/payments/{operation_id} - Payment operation status
pub async fn get_payment(
    State(state): State<ApiState>,
    Path(operation_id): Path<String>,
) -> ApiResult<PaymentOperation> {
    state
        .service
        .operation(&operation_id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::OperationNotFound(operation_id).into())
}

/// POST /api/outputs/spent - Record an output spent outside this service
pub async fn mark_output_spent(
    State(state): State<ApiState>,
    Json(req): Json<SpentOutputRequest>,
) -> ApiResult<SpentResponse> {
    if req.tx_id.trim().is_empty() || req.address.trim().is_empty() {
        return Err(EngineError::InvalidInput("tx_id and address are required".to_string()).into());
    }
    let output = Output::new(req.tx_id, req.output_index, req.address, req.value, 0);
    let recorded = state.service.mark_externally_spent(&output).await?;
    Ok(Json(SpentResponse {
        outpoint: output.outpoint.to_string(),
        recorded,
    }))
}

/// GET /api/settlements - Settlement records
pub async fn list_settlements(State(state): State<ApiState>) -> ApiResult<Vec<SettlementRecord>> {
    Ok(Json(state.service.settlements().await?))
}

/// POST /api/ledger/sweep - Run ledger maintenance now
pub async fn sweep_ledger(State(state): State<ApiState>) -> ApiResult<MaintenanceReport> {
    Ok(Json(state.service.run_maintenance().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::websocket::WsEvent;
    use crate::chain::MemoryChain;
    use crate::config::ServiceConfig;
    use crate::service::EngineStores;
    use crate::sign::PassthroughSigner;
    use crate::storage::MemoryBackend;

    fn state() -> (Arc<MemoryChain>, ApiState) {
        let chain = Arc::new(MemoryChain::new(100));
        let ws_broadcaster = Arc::new(WsBroadcaster::new());
        let service = SettlementService::new(
            ServiceConfig::default(),
            chain.clone(),
            Arc::new(PassthroughSigner),
            EngineStores::from(&MemoryBackend::new()),
            ws_broadcaster.clone(),
            None,
        )
        .unwrap();
        (
            chain,
            ApiState {
                service: Arc::new(service),
                ws_broadcaster,
            },
        )
    }

    #[tokio::test]
    async fn test_observation_conflict() {
        let (_, state) = state();
        let (status, _) = subscribe_wallet(State(state.clone()), Path("W".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let (status, _) = subscribe_wallet(State(state.clone()), Path("W".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = unsubscribe_wallet(State(state.clone()), Path("W".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let (status, Json(body)) = unsubscribe_wallet(State(state), Path("W".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.observed);
    }

    #[tokio::test]
    async fn test_settlement_waits_for_a_client() {
        let (chain, state) = state();
        chain.fund("A", 20_000, 6).await;
        state.service.send_payment("A", "B", 5_000).await.unwrap();
        chain.mine(6).await;

        let report = state.service.poll_cash_out().await.unwrap();
        assert_eq!(report.settled, 0);
        let records = state.service.settlements().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].delivered);

        let mut rx = state.ws_broadcaster.subscribe();
        let report = state.service.poll_cash_out().await.unwrap();
        assert_eq!(report.redelivered, 1);
        assert!(matches!(rx.recv().await.unwrap(), WsEvent::Settlement { .. }));
        assert!(state.service.settlements().await.unwrap()[0].delivered);
    }

    #[tokio::test]
    async fn test_missing_balance_is_not_found() {
        let (_, state) = state();
        let err = get_balance(State(state), Path("W".to_string())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_and_broadcast() {
        let (chain, state) = state();
        chain.fund("A", 20_000, 6).await;

        let Json(built) = build_payment(
            State(state.clone()),
            Json(BuildPaymentRequest {
                source: "A".to_string(),
                destination: "B".to_string(),
                amount: 5_000,
            }),
        )
        .await
        .unwrap();
        assert_eq!(built.fee, 2_260);

        let Json(sent) = broadcast_payment(
            State(state.clone()),
            Json(BroadcastRequest {
                operation_id: built.operation_id.clone(),
                hex: built.transaction_hex,
            }),
        )
        .await
        .unwrap();
        assert!(chain.contains(&sent.tx_id).await);

        let Json(op) = get_payment(State(state), Path(built.operation_id)).await.unwrap();
        assert_eq!(op.tx_id(), Some(sent.tx_id.as_str()));
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_status() {
        let (chain, state) = state();
        chain.fund("A", 500, 6).await;

        let err = build_payment(
            State(state.clone()),
            Json(BuildPaymentRequest {
                source: "A".to_string(),
                destination: "B".to_string(),
                amount: 600,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1.kind, "insufficient_funds");

        chain.set_unavailable(true).await;
        let err = build_payment(
            State(state),
            Json(BuildPaymentRequest {
                source: "A".to_string(),
                destination: "B".to_string(),
                amount: 600,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_list_take_is_capped() {
        let query = BalanceQuery {
            take: Some(5_000),
            continuation: None,
        };
        assert_eq!(query.take.unwrap_or(DEFAULT_TAKE).min(MAX_TAKE), MAX_TAKE);
    }
}
