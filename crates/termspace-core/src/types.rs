//! Persistent entities and their typed sub-records
//!
//! Session, user-process, and layout records mirror the store rows. The
//! blobs persisted as strings (environment map, terminal size, layout
//! configuration) have typed forms here with explicit encode/decode
//! boundaries; patches to session state are a closed sum rather than a
//! loose field bag.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TermspaceError};

/// Shell history entries kept per session.
pub const SHELL_HISTORY_LIMIT: usize = 100;

/// Default absence-of-client bound, in minutes (24h).
pub const DEFAULT_MAX_IDLE_MINUTES: i64 = 1440;

/// A workspace as reported by the workspace service. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Terminated => "terminated",
        }
    }
}

pub fn parse_session_status(s: &str) -> SessionStatus {
    match s {
        "active" => SessionStatus::Active,
        "paused" => SessionStatus::Paused,
        _ => SessionStatus::Terminated,
    }
}

/// Why a session was terminated. Logged and carried on lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    IdleTimeout,
    CleanupExpired,
    ProcessExit,
    ManualClose,
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::CleanupExpired => "cleanup_expired",
            TerminationReason::ProcessExit => "process_exit",
            TerminationReason::ManualClose => "manual_close",
            TerminationReason::Shutdown => "shutdown",
        }
    }
}

/// One remembered shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal dimensions, persisted as a JSON blob on the session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("terminal size serializes")
    }

    pub fn decode(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 30 }
    }
}

/// Environment variables, persisted as a JSON object blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentVars(pub BTreeMap<String, String>);

impl EnvironmentVars {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("env map serializes")
    }

    pub fn decode(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// A typed patch to mutable session state. Each update also bumps the
/// activity timestamp and, when a command is set, appends it to the
/// bounded shell history.
#[derive(Debug, Clone)]
pub enum SessionPatch {
    CurrentWorkingDir(String),
    EnvironmentVars(EnvironmentVars),
    TerminalSize(TerminalSize),
    LastCommand(String),
}

/// The persistent session row: identity, runtime linkage, shell state,
/// retention policy, and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub workspace_id: String,
    pub recovery_token: String,
    pub session_name: String,
    pub is_default_session: bool,
    pub session_type: String,

    pub shell_pid: Option<u32>,
    pub socket_id: Option<String>,
    pub status: SessionStatus,

    pub current_working_dir: Option<String>,
    pub environment_vars: Option<String>,
    pub terminal_size: Option<String>,
    pub last_command: Option<String>,
    pub shell_history: Vec<HistoryEntry>,

    pub session_timeout: Option<i64>,
    pub max_idle_time: i64,
    pub auto_cleanup: bool,
    pub can_recover: bool,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    /// Apply a typed patch. Activity bookkeeping is the caller's job.
    pub fn apply_patch(&mut self, patch: &SessionPatch) {
        match patch {
            SessionPatch::CurrentWorkingDir(cwd) => {
                self.current_working_dir = Some(cwd.clone());
            }
            SessionPatch::EnvironmentVars(env) => {
                self.environment_vars = Some(env.encode());
            }
            SessionPatch::TerminalSize(size) => {
                self.terminal_size = Some(size.encode());
            }
            SessionPatch::LastCommand(command) => {
                self.last_command = Some(command.clone());
            }
        }
    }

    /// Append to the bounded shell history, dropping the oldest entries.
    pub fn push_shell_history(&mut self, command: &str, timestamp: DateTime<Utc>) {
        self.shell_history.push(HistoryEntry {
            command: command.to_string(),
            timestamp,
        });
        if self.shell_history.len() > SHELL_HISTORY_LIMIT {
            let excess = self.shell_history.len() - SHELL_HISTORY_LIMIT;
            self.shell_history.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Crashed,
    Killed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Killed => "killed",
        }
    }

    pub fn is_dead(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

pub fn parse_process_status(s: &str) -> ProcessStatus {
    match s {
        "running" => ProcessStatus::Running,
        "stopped" => ProcessStatus::Stopped,
        "killed" => ProcessStatus::Killed,
        _ => ProcessStatus::Crashed,
    }
}

/// A tracked long-running child command, independent of any PTY session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProcessRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub auto_restart: bool,
    pub restart_count: i64,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutType {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "horizontal-split")]
    HorizontalSplit,
    #[serde(rename = "vertical-split")]
    VerticalSplit,
    #[serde(rename = "three-pane")]
    ThreePane,
    #[serde(rename = "grid-2x2")]
    Grid2x2,
}

impl LayoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutType::Single => "single",
            LayoutType::HorizontalSplit => "horizontal-split",
            LayoutType::VerticalSplit => "vertical-split",
            LayoutType::ThreePane => "three-pane",
            LayoutType::Grid2x2 => "grid-2x2",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(LayoutType::Single),
            "horizontal-split" => Ok(LayoutType::HorizontalSplit),
            "vertical-split" => Ok(LayoutType::VerticalSplit),
            "three-pane" => Ok(LayoutType::ThreePane),
            "grid-2x2" => Ok(LayoutType::Grid2x2),
            other => Err(TermspaceError::InvalidLayoutType(other.to_string())),
        }
    }

    pub fn pane_count(&self) -> usize {
        match self {
            LayoutType::Single => 1,
            LayoutType::HorizontalSplit | LayoutType::VerticalSplit => 2,
            LayoutType::ThreePane => 3,
            LayoutType::Grid2x2 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneStatus {
    Pending,
    Active,
}

/// One rectangular region of a layout holding an ordered list of
/// session tabs. `grid_area` is a CSS grid string carried verbatim for
/// the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pane {
    pub id: String,
    pub position: String,
    pub grid_area: String,
    pub tabs: Vec<String>,
    pub active_tab_id: Option<String>,
    pub status: PaneStatus,
}

impl Pane {
    /// Restore the pane invariants after a tab mutation: the active tab
    /// must be a member of `tabs`, and an empty pane is pending.
    pub fn normalize(&mut self) {
        if self.tabs.is_empty() {
            self.active_tab_id = None;
            self.status = PaneStatus::Pending;
            return;
        }
        match &self.active_tab_id {
            Some(active) if self.tabs.contains(active) => {}
            _ => self.active_tab_id = Some(self.tabs[0].clone()),
        }
        self.status = PaneStatus::Active;
    }
}

/// The layout configuration blob persisted as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(rename = "type")]
    pub layout_type: LayoutType,
    pub panes: Vec<Pane>,
}

impl LayoutConfig {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("layout config serializes")
    }

    pub fn decode(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// The persistent layout row for a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub layout_type: LayoutType,
    pub is_default: bool,
    pub configuration: LayoutConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// CSRF token row; the core only evicts expired ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfTokenRecord {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Rate-limit row; the core only evicts expired ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub id: i64,
    pub client_ip: String,
    pub key_prefix: String,
    pub request_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Terminated,
        ] {
            assert_eq!(parse_session_status(status.as_str()), status);
        }
        assert_eq!(parse_session_status("garbage"), SessionStatus::Terminated);
    }

    #[test]
    fn test_layout_type_parse() {
        assert_eq!(LayoutType::parse("grid-2x2").unwrap(), LayoutType::Grid2x2);
        assert!(LayoutType::parse("five-pane").is_err());
    }

    #[test]
    fn test_terminal_size_codec() {
        let size = TerminalSize { cols: 120, rows: 40 };
        let decoded = TerminalSize::decode(&size.encode()).unwrap();
        assert_eq!(decoded, size);
        assert!(TerminalSize::decode("not json").is_err());
    }

    #[test]
    fn test_env_codec() {
        let mut env = EnvironmentVars::default();
        env.0.insert("PATH".to_string(), "/usr/bin".to_string());
        let decoded = EnvironmentVars::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_shell_history_is_bounded() {
        let mut session = sample_session();
        for i in 0..(SHELL_HISTORY_LIMIT + 20) {
            session.push_shell_history(&format!("cmd-{i}"), Utc::now());
        }
        assert_eq!(session.shell_history.len(), SHELL_HISTORY_LIMIT);
        assert_eq!(session.shell_history[0].command, "cmd-20");
    }

    #[test]
    fn test_pane_normalize() {
        let mut pane = Pane {
            id: "pane-1".to_string(),
            position: "main".to_string(),
            grid_area: "1 / 1 / 2 / 2".to_string(),
            tabs: vec!["s1".to_string(), "s2".to_string()],
            active_tab_id: Some("s3".to_string()),
            status: PaneStatus::Pending,
        };
        pane.normalize();
        assert_eq!(pane.active_tab_id.as_deref(), Some("s1"));
        assert_eq!(pane.status, PaneStatus::Active);

        pane.tabs.clear();
        pane.normalize();
        assert_eq!(pane.active_tab_id, None);
        assert_eq!(pane.status, PaneStatus::Pending);
    }

    #[test]
    fn test_layout_config_codec_uses_wire_names() {
        let config = LayoutConfig {
            layout_type: LayoutType::HorizontalSplit,
            panes: vec![Pane {
                id: "pane-1".to_string(),
                position: "left".to_string(),
                grid_area: "1 / 1 / 2 / 2".to_string(),
                tabs: vec!["s1".to_string()],
                active_tab_id: Some("s1".to_string()),
                status: PaneStatus::Active,
            }],
        };
        let blob = config.encode();
        assert!(blob.contains("\"type\":\"horizontal-split\""));
        assert!(blob.contains("\"gridArea\""));
        assert!(blob.contains("\"activeTabId\""));
        let decoded = LayoutConfig::decode(&blob).unwrap();
        assert_eq!(decoded.panes.len(), 1);
    }

    fn sample_session() -> SessionRecord {
        SessionRecord {
            id: "s1".to_string(),
            workspace_id: "w1".to_string(),
            recovery_token: "tok".to_string(),
            session_name: "Terminal 1".to_string(),
            is_default_session: true,
            session_type: "terminal".to_string(),
            shell_pid: None,
            socket_id: None,
            status: SessionStatus::Active,
            current_working_dir: None,
            environment_vars: None,
            terminal_size: None,
            last_command: None,
            shell_history: Vec::new(),
            session_timeout: None,
            max_idle_time: DEFAULT_MAX_IDLE_MINUTES,
            auto_cleanup: true,
            can_recover: true,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            ended_at: None,
        }
    }
}
