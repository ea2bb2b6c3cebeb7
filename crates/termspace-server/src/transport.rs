//! Socket transport abstraction
//!
//! The multiplexer talks to browsers through `ClientTransport`: direct
//! per-socket emission plus rooms keyed `workspace:<id>` for fan-out.
//! Emission is best-effort per socket; a slow or dead client never
//! stalls the PTY reader.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub type SocketId = String;

pub fn workspace_room(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

/// Messages sent to browser clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    TerminalCreated {
        workspace_id: String,
        session_id: String,
        session_name: String,
        recovery_token: String,
    },
    TerminalResumed {
        workspace_id: String,
        session_id: String,
        session_name: String,
        recovery_token: String,
    },
    TerminalRecovered {
        workspace_id: String,
        session_id: String,
        session_name: String,
        recovery_token: String,
        recovered_state: RecoveredState,
    },
    TerminalOutput {
        session_id: String,
        data: String,
    },
    TerminalKilled {
        workspace_id: String,
        session_id: String,
    },
    TerminalInfo {
        workspace_id: Option<String>,
        session_id: Option<String>,
    },
    TerminalError {
        error: String,
    },
}

/// Last-known shell state announced on recovery. The shell's in-process
/// state is gone; this is metadata only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredState {
    pub current_dir: Option<String>,
    pub env_vars: Option<String>,
    pub terminal_size: Option<String>,
}

/// Messages received from browser clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    CreateTerminal {
        workspace_id: Option<String>,
        session_id: Option<String>,
        recovery_token: Option<String>,
    },
    TerminalInput {
        data: String,
        session_id: Option<String>,
    },
    TerminalResize {
        cols: u16,
        rows: u16,
        session_id: Option<String>,
    },
    KillTerminal {
        workspace_id: String,
        session_id: Option<String>,
    },
    GetTerminalInfo,
}

#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Best-effort delivery to one socket.
    async fn emit(&self, socket_id: &str, event: ServerEvent);
    /// Best-effort delivery to every socket in a room.
    async fn emit_to_room(&self, room: &str, event: ServerEvent);
    async fn join_room(&self, socket_id: &str, room: &str);
    async fn leave_room(&self, socket_id: &str, room: &str);
}

/// Transport double that records what each socket would have received.
#[derive(Default)]
pub struct InMemoryTransport {
    sent: DashMap<SocketId, Vec<ServerEvent>>,
    rooms: DashMap<String, HashSet<SocketId>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, socket_id: &str) -> Vec<ServerEvent> {
        self.sent
            .get(socket_id)
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self, socket_id: &str) {
        self.sent.remove(socket_id);
    }

    pub fn room_members(&self, room: &str) -> HashSet<SocketId> {
        self.rooms
            .get(room)
            .map(|members| members.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClientTransport for InMemoryTransport {
    async fn emit(&self, socket_id: &str, event: ServerEvent) {
        self.sent
            .entry(socket_id.to_string())
            .or_default()
            .push(event);
    }

    async fn emit_to_room(&self, room: &str, event: ServerEvent) {
        let members = self.room_members(room);
        for socket_id in members {
            self.sent.entry(socket_id).or_default().push(event.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_room_fanout() {
        let transport = InMemoryTransport::new();
        transport.join_room("s1", "workspace:w1").await;
        transport.join_room("s2", "workspace:w1").await;
        transport.join_room("s3", "workspace:w2").await;

        transport
            .emit_to_room(
                "workspace:w1",
                ServerEvent::TerminalOutput {
                    session_id: "a".to_string(),
                    data: "hi".to_string(),
                },
            )
            .await;

        assert_eq!(transport.events_for("s1").len(), 1);
        assert_eq!(transport.events_for("s2").len(), 1);
        assert!(transport.events_for("s3").is_empty());

        transport.leave_room("s2", "workspace:w1").await;
        transport
            .emit_to_room(
                "workspace:w1",
                ServerEvent::TerminalKilled {
                    workspace_id: "w1".to_string(),
                    session_id: "a".to_string(),
                },
            )
            .await;
        assert_eq!(transport.events_for("s1").len(), 2);
        assert_eq!(transport.events_for("s2").len(), 1);
    }

    #[test]
    fn test_event_wire_format() {
        let event = ServerEvent::TerminalCreated {
            workspace_id: "w1".to_string(),
            session_id: "s1".to_string(),
            session_name: "Terminal 1".to_string(),
            recovery_token: "tok".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"terminal-created\""));
        assert!(json.contains("\"workspaceId\":\"w1\""));
        assert!(json.contains("\"recoveryToken\":\"tok\""));
    }

    #[test]
    fn test_client_event_parse() {
        let json = r#"{"type":"terminal-input","data":"ls\n","sessionId":"s1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ClientEvent::TerminalInput {
                data: "ls\n".to_string(),
                session_id: Some("s1".to_string()),
            }
        );

        let json = r#"{"type":"create-terminal"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ClientEvent::CreateTerminal {
                workspace_id: None,
                session_id: None,
                recovery_token: None,
            }
        );
    }
}
