//! Error types for termspace

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TermspaceError>;

#[derive(Error, Debug)]
pub enum TermspaceError {
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is terminated: {0}")]
    SessionTerminated(String),

    #[error("Layout not found: {0}")]
    LayoutNotFound(String),

    #[error("Pane not found: {0}")]
    PaneNotFound(String),

    #[error("Session {session_id} is not a tab of pane {pane_id}")]
    TabNotInPane {
        session_id: String,
        pane_id: String,
    },

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Invalid layout type: {0}")]
    InvalidLayoutType(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
