//! WebSocket stream of ledger events
//!
//! Each connection subscribes to the ledger's event bus and receives every
//! event as a JSON text frame.

use crate::api::handlers::ApiState;
use crate::ledger::{Ledger, LedgerEvent};
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
use tokio::sync::broadcast::error::RecvError;

/// First frame sent on every connection
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Welcome {
    #[serde(rename = "type")]
    kind: &'static str,
    height: u64,
    latest_hash: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    let ledger = state.ledger.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, ledger))
}

fn to_frame(event: &LedgerEvent) -> Option<Message> {
    serde_json::to_string(event)
        .ok()
        .map(|json| Message::Text(json.into()))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, ledger: Arc<Ledger>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the tip so no commit falls in between
    let mut rx = ledger.subscribe();
    let shutdown = ledger.shutdown_token();

    let info = ledger.chain_info().await;
    let welcome = Welcome {
        kind: "Connected",
        height: info.height,
        latest_hash: info.latest_hash,
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Forward ledger events to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let Some(frame) = to_frame(&event) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("WebSocket client lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Handle incoming messages (for ping/pong and graceful close)
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    // Pong is handled automatically by axum
                    log::debug!("Received ping: {:?}", data);
                }
                Ok(Message::Text(text)) => {
                    log::debug!("Ignoring client message: {}", text);
                }
                Err(e) => {
                    log::warn!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    log::debug!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rejection;

    #[test]
    fn test_event_frame() {
        let event = LedgerEvent::TransactionDropped {
            hash: "abc123".to_string(),
            reason: Rejection::InsufficientFunds,
        };
        let Some(Message::Text(text)) = to_frame(&event) else {
            panic!("expected a text frame");
        };
        assert!(text.as_str().contains("TransactionDropped"));
        assert!(text.as_str().contains("InsufficientFunds"));
    }

    #[test]
    fn test_welcome_serialization() {
        let welcome = Welcome {
            kind: "Connected",
            height: 3,
            latest_hash: "00ab".to_string(),
        };
        let json = serde_json::to_value(&welcome).unwrap();
        assert_eq!(json["type"], "Connected");
        assert_eq!(json["latestHash"], "00ab");
    }
}
