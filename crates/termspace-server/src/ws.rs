//! WebSocket handler for real-time terminal communication
//!
//! Bridges browser sockets to the PTY multiplexer: each connection gets
//! a socket id, an outbound event channel drained into the WebSocket,
//! and a read loop dispatching client events. Room bookkeeping lives in
//! `WsTransport`, the production `ClientTransport`.

use std::collections::HashSet;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{ClientEvent, ClientTransport, ServerEvent, SocketId};
use crate::AppState;

/// Production transport: one outbound channel per connected socket plus
/// room membership for workspace fan-out. Emission is best-effort; a
/// closed channel is logged and skipped.
#[derive(Default)]
pub struct WsTransport {
    sockets: DashMap<SocketId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: DashMap<String, HashSet<SocketId>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(socket_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, socket_id: &str) {
        self.sockets.remove(socket_id);
        for mut members in self.rooms.iter_mut() {
            members.remove(socket_id);
        }
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn emit(&self, socket_id: &str, event: ServerEvent) {
        if let Some(tx) = self.sockets.get(socket_id) {
            if tx.send(event).is_err() {
                debug!("Dropped event for closed socket {}", socket_id);
            }
        }
    }

    async fn emit_to_room(&self, room: &str, event: ServerEvent) {
        let members: Vec<SocketId> = self
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        for socket_id in members {
            if let Some(tx) = self.sockets.get(&socket_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    async fn join_room(&self, socket_id: &str, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket_id.to_string());
    }

    async fn leave_room(&self, socket_id: &str, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(socket_id);
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let socket_id = format!("socket-{}", Uuid::new_v4());
    debug!("Socket connected: {}", socket_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.transport.register(&socket_id);

    // Outbound pump: transport events serialized onto the wire.
    let forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize server event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Socket {} receive error: {}", socket_id, e);
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&state, &socket_id, event).await,
                Err(e) => {
                    state
                        .transport
                        .emit(
                            &socket_id,
                            ServerEvent::TerminalError {
                                error: format!("invalid message: {e}"),
                            },
                        )
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    state.transport.unregister(&socket_id);
    state.mux.handle_socket_disconnect(&socket_id).await;
    info!("Socket disconnected: {}", socket_id);
}

async fn dispatch(state: &AppState, socket_id: &str, event: ClientEvent) {
    let result = match event {
        ClientEvent::CreateTerminal {
            workspace_id,
            session_id,
            recovery_token,
        } => state
            .mux
            .create_pty_for_socket(
                socket_id,
                workspace_id.as_deref(),
                session_id.as_deref(),
                recovery_token.as_deref(),
            )
            .await
            .map(|_| ()),
        ClientEvent::TerminalInput { data, session_id } => {
            state
                .mux
                .write_to_pty(socket_id, &data, session_id.as_deref())
                .await
        }
        ClientEvent::TerminalResize {
            cols,
            rows,
            session_id,
        } => {
            state
                .mux
                .resize_pty(socket_id, cols, rows, session_id.as_deref())
                .await
        }
        ClientEvent::KillTerminal {
            workspace_id,
            session_id,
        } => {
            let target = match session_id {
                Some(session_id) => Some(session_id),
                None => state
                    .mux
                    .get_socket_attachment(socket_id)
                    .await
                    .filter(|(ws, _)| *ws == workspace_id)
                    .map(|(_, session)| session),
            };
            match target {
                Some(session_id) => state.mux.close_session(&workspace_id, &session_id).await,
                None => Err(termspace_core::TermspaceError::SessionNotFound(
                    "no session attached".to_string(),
                )),
            }
        }
        ClientEvent::GetTerminalInfo => {
            let attachment = state.mux.get_socket_attachment(socket_id).await;
            let (workspace_id, session_id) = match attachment {
                Some((workspace_id, session_id)) => (Some(workspace_id), Some(session_id)),
                None => (None, None),
            };
            state
                .transport
                .emit(
                    socket_id,
                    ServerEvent::TerminalInfo {
                        workspace_id,
                        session_id,
                    },
                )
                .await;
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("Socket {} request failed: {}", socket_id, e);
        state
            .transport
            .emit(
                socket_id,
                ServerEvent::TerminalError {
                    error: e.to_string(),
                },
            )
            .await;
    }
}
