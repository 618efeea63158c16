//! WebSocket endpoint for receivers
//!
//! Each connection registers an outbound queue with the coordinator and runs
//! a single task that both drains that queue onto the socket and feeds inbound
//! text frames to the coordinator. The session is unregistered when either
//! side closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use audiosync_common::ServerMessage;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AppState;

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Arc<ServerMessage>>();
    let coordinator = Arc::clone(&state.coordinator);
    let client_id = coordinator.register_session(tx).await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // Errors are already logged and never fatal for the session
                    let _ = coordinator.handle_text(&client_id, &text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", client_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", client_id, e);
                    break;
                }
            },

            Some(message) = outbound.recv() => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping {} for {}: {}", message.kind(), client_id, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!("Send to {} failed, closing session", client_id);
                    break;
                }
            }
        }
    }

    coordinator.unregister_session(&client_id).await;
}
