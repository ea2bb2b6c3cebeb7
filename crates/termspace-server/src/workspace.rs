//! Workspace service collaborator
//!
//! The core reads workspaces, it never creates or syncs them. The
//! production implementation serves the roots named in the settings
//! file; tests use the same type with a hand-built list.

use async_trait::async_trait;
use termspace_core::Workspace;

use crate::config::WorkspaceEntry;

#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn get_workspace(&self, id: &str) -> Option<Workspace>;
    /// All workspaces, in configuration order.
    async fn list_workspaces(&self) -> Vec<Workspace>;
}

pub struct ConfigWorkspaceService {
    workspaces: Vec<Workspace>,
}

impl ConfigWorkspaceService {
    pub fn new(entries: Vec<WorkspaceEntry>) -> Self {
        Self {
            workspaces: entries.into_iter().map(Workspace::from).collect(),
        }
    }

    pub fn from_workspaces(workspaces: Vec<Workspace>) -> Self {
        Self { workspaces }
    }
}

#[async_trait]
impl WorkspaceService for ConfigWorkspaceService {
    async fn get_workspace(&self, id: &str) -> Option<Workspace> {
        self.workspaces.iter().find(|w| w.id == id).cloned()
    }

    async fn list_workspaces(&self) -> Vec<Workspace> {
        self.workspaces.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_lookup_and_order() {
        let service = ConfigWorkspaceService::from_workspaces(vec![
            Workspace {
                id: "w1".to_string(),
                name: "alpha".to_string(),
                local_path: PathBuf::from("/tmp/alpha"),
            },
            Workspace {
                id: "w2".to_string(),
                name: "beta".to_string(),
                local_path: PathBuf::from("/tmp/beta"),
            },
        ]);

        assert_eq!(service.get_workspace("w2").await.unwrap().name, "beta");
        assert!(service.get_workspace("w3").await.is_none());
        assert_eq!(service.list_workspaces().await[0].id, "w1");
    }
}
