//! WebSocket approval channel.
//!
//! A client registers for one session at a time, receives approval requests
//! and agent messages for it, and answers with `tool_approval_response`.
//! Frames that do not decode into a known message type are answered with an
//! `error` frame and otherwise ignored.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use harness::approval::{ApprovalBroker, ListenerId, ListenerTx};
use harness::protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state.coordinator.broker().clone(), tx);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    connection.close().await;
    writer.abort();
}

/// Per-socket dispatch state: the outbound channel and the current
/// registration, if any.
struct Connection {
    broker: Arc<ApprovalBroker>,
    tx: ListenerTx,
    registration: Option<(String, ListenerId)>,
}

impl Connection {
    fn new(broker: Arc<ApprovalBroker>, tx: ListenerTx) -> Self {
        Self {
            broker,
            tx,
            registration: None,
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "rejecting malformed client frame");
                self.reply(ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                });
                return;
            }
        };

        match message {
            ClientMessage::RegisterSession { session_id } => {
                if let Some((previous, id)) = self.registration.take() {
                    self.broker.unregister_listener(&previous, id).await;
                }
                let id = self
                    .broker
                    .register_listener(&session_id, self.tx.clone())
                    .await;
                info!(session_id = %session_id, "approval listener registered");
                self.reply(ServerMessage::Registered {
                    session_id: session_id.clone(),
                });
                self.registration = Some((session_id, id));
            }
            ClientMessage::ToolApprovalResponse(decision) => {
                let tool_use_id = decision.tool_use_id.clone();
                if !self.broker.submit_decision(decision).await {
                    self.reply(ServerMessage::Error {
                        message: format!("no pending approval for {tool_use_id}"),
                    });
                }
            }
        }
    }

    fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    async fn close(self) {
        if let Some((session_id, id)) = self.registration {
            self.broker.unregister_listener(&session_id, id).await;
            info!(session_id = %session_id, "approval listener disconnected");
        }
    }
}
