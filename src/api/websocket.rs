//! WebSocket support for real-time settlement updates
//!
//! The broadcaster doubles as the engine's settlement sink: every delivered
//! settlement is fanned out to connected clients. With no client connected
//! the sink reports itself closed, so the settlement stays undelivered and is
//! sent again on a later poll.

use crate::detector::{HandlerError, SettlementEvent, SettlementSink};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Maximum number of events to buffer per subscriber
const BROADCAST_CAPACITY: usize = 100;

/// WebSocket events that can be broadcast to clients
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsEvent {
    /// A transaction crossed a settlement threshold
    Settlement { event: SettlementEvent },
    /// Connection established
    Connected { message: String },
    /// Heartbeat to keep connection alive
    Ping,
}

/// Broadcaster for WebSocket events
#[derive(Debug)]
pub struct WsBroadcaster {
    sender: broadcast::Sender<WsEvent>,
}

impl WsBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Broadcast an event to all connected clients, returning how many
    /// received it
    pub fn broadcast(&self, event: WsEvent) -> usize {
        // no subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementSink for WsBroadcaster {
    async fn handle(&self, event: &SettlementEvent) -> Result<(), HandlerError> {
        let receivers = self.broadcast(WsEvent::Settlement {
            event: event.clone(),
        });
        if receivers == 0 {
            log::debug!(
                "No clients for settlement {} {:?} tx {}, keeping it pending",
                event.kind,
                event.stage,
                event.tx_id
            );
            return Err(HandlerError::Closed);
        }
        log::info!(
            "Settlement {} {:?} tx {} op {} ({} confirmations) sent to {} clients",
            event.kind,
            event.stage,
            event.tx_id,
            event.operation_id,
            event.confirmations,
            receivers
        );
        Ok(())
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<crate::api::handlers::ApiState>,
) -> impl IntoResponse {
    let broadcaster = state.ws_broadcaster.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, broadcaster: Arc<WsBroadcaster>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = broadcaster.subscribe();

    let welcome = WsEvent::Connected {
        message: "Connected to settlement events".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("WebSocket client lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    log::debug!("Received text message: {}", text);
                }
                Err(e) => {
                    log::warn!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    log::info!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SettlementKind, SettlementStage};
    use chrono::Utc;

    fn event() -> SettlementEvent {
        SettlementEvent {
            tx_id: "abc123".to_string(),
            operation_id: "op1".to_string(),
            kind: SettlementKind::CashOut,
            stage: SettlementStage::Final,
            confirmations: 6,
            address: "A".to_string(),
            amount: 5_000,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_broadcast_with_no_subscribers() {
        let broadcaster = WsBroadcaster::new();
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.broadcast(WsEvent::Ping), 0);
    }

    #[tokio::test]
    async fn test_sink_fans_out() {
        let broadcaster = WsBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.handle(&event()).await.unwrap();
        match rx.recv().await.unwrap() {
            WsEvent::Settlement { event } => assert_eq!(event.tx_id, "abc123"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_without_clients_reports_closed() {
        let broadcaster = WsBroadcaster::new();
        assert_eq!(broadcaster.handle(&event()).await, Err(HandlerError::Closed));

        let rx = broadcaster.subscribe();
        drop(rx);
        assert_eq!(broadcaster.handle(&event()).await, Err(HandlerError::Closed));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&WsEvent::Settlement { event: event() }).unwrap();
        assert!(json.contains("\"type\":\"Settlement\""));
        assert!(json.contains("abc123"));
        assert!(json.contains("CashOut"));
    }
}
