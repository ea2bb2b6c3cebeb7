//! Server settings
//!
//! Layered configuration: built-in defaults, an optional `termspace`
//! config file in the working directory, then `TERMSPACE_*` environment
//! overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use termspace_core::Workspace;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_address: String,
    /// Path of the embedded SQLite database file.
    pub database_path: String,
    /// Directory holding per-session scrollback logs.
    pub history_dir: PathBuf,
    /// Workspaces served by this instance.
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceEntry {
    pub id: String,
    pub name: String,
    pub local_path: PathBuf,
}

impl From<WorkspaceEntry> for Workspace {
    fn from(entry: WorkspaceEntry) -> Self {
        Workspace {
            id: entry.id,
            name: entry.name,
            local_path: entry.local_path,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("bind_address", "127.0.0.1:3014")?
            .set_default("database_path", "data/termspace.db")?
            .set_default("history_dir", "data/history")?
            .add_source(config::File::with_name("termspace").required(false))
            .add_source(config::Environment::with_prefix("TERMSPACE"))
            .build()
            .context("Failed to build configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration values")
    }
}
