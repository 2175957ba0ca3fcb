//! WebSocket transport for the notification gateway.
//!
//! Client messages are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "subscribe:session", "session_id": "batch-1"}
//! {"type": "unsubscribe:session", "session_id": "batch-1"}
//! {"type": "subscribe:document", "document_id": "0190..."}
//! {"type": "unsubscribe:document", "document_id": "0190..."}
//! ```
//!
//! The server answers each with an `ack` or `error` message and pushes
//! `job:*` events as they are routed to the connection.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use strata_core::defaults::GATEWAY_PING_INTERVAL_SECS;

use crate::gateway::{ConnectionId, NotificationGateway};
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe:session")]
    SubscribeSession { session_id: String },
    #[serde(rename = "unsubscribe:session")]
    UnsubscribeSession { session_id: String },
    #[serde(rename = "subscribe:document")]
    SubscribeDocument { document_id: Uuid },
    #[serde(rename = "unsubscribe:document")]
    UnsubscribeDocument { document_id: Uuid },
}

impl ClientMessage {
    fn action(&self) -> &'static str {
        match self {
            ClientMessage::SubscribeSession { .. } => "subscribe:session",
            ClientMessage::UnsubscribeSession { .. } => "unsubscribe:session",
            ClientMessage::SubscribeDocument { .. } => "subscribe:document",
            ClientMessage::UnsubscribeDocument { .. } => "unsubscribe:document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerReply {
    Ack {
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
    },
    Error {
        message: String,
    },
}

impl ServerReply {
    fn error(message: impl Into<String>) -> Self {
        ServerReply::Error {
            message: message.into(),
        }
    }
}

/// Parse a text frame into a client message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let message: ClientMessage =
        serde_json::from_str(text).map_err(|e| format!("unrecognized message: {e}"))?;
    if let ClientMessage::SubscribeSession { session_id }
    | ClientMessage::UnsubscribeSession { session_id } = &message
    {
        if session_id.trim().is_empty() {
            return Err("session_id must not be empty".to_string());
        }
    }
    Ok(message)
}

/// Apply one client text frame to the gateway and build the reply.
pub async fn handle_client_text(
    gateway: &NotificationGateway,
    connection_id: ConnectionId,
    text: &str,
) -> ServerReply {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(reason) => return ServerReply::error(reason),
    };
    let action = message.action().to_string();

    match message {
        ClientMessage::SubscribeSession { session_id } => {
            gateway.join_session(connection_id, &session_id).await;
            ServerReply::Ack {
                action,
                session_id: Some(session_id),
                document_id: None,
            }
        }
        ClientMessage::UnsubscribeSession { session_id } => {
            gateway.leave_session(connection_id, &session_id).await;
            ServerReply::Ack {
                action,
                session_id: Some(session_id),
                document_id: None,
            }
        }
        ClientMessage::SubscribeDocument { document_id } => {
            gateway.join_document(connection_id, document_id).await;
            ServerReply::Ack {
                action,
                session_id: None,
                document_id: Some(document_id),
            }
        }
        ClientMessage::UnsubscribeDocument { document_id } => {
            gateway.leave_document(connection_id, document_id).await;
            ServerReply::Ack {
                action,
                session_id: None,
                document_id: Some(document_id),
            }
        }
    }
}

/// `GET /api/v1/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let gateway = state.gateway.clone();
    let (connection_id, mut outbound) = gateway.connect().await;
    info!(connection_id, "WebSocket connection opened");

    let (mut sender, mut receiver) = socket.split();

    // Drain the gateway queue and keep the connection alive
    let mut send_task = tokio::spawn(async move {
        let period = Duration::from_secs(GATEWAY_PING_INTERVAL_SECS);
        let mut ping_interval = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(text) = message else { break };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_gateway = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    let reply = handle_client_text(&recv_gateway, connection_id, &text).await;
                    match serde_json::to_string(&reply) {
                        Ok(json) => {
                            recv_gateway.send_to(connection_id, json).await;
                        }
                        Err(e) => debug!(error = %e, "Failed to serialize reply"),
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.disconnect(connection_id).await;
    info!(connection_id, "WebSocket connection closed");
}
