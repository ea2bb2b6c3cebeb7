//! Layout engine
//!
//! Per-workspace pane/tab topology. Every mutation re-serializes the
//! configuration blob through the store; after each operation a session
//! appears in at most one pane, a non-empty pane's active tab is one of
//! its tabs, and an empty pane is pending.

use std::sync::Arc;

use tracing::{info, warn};

use termspace_core::{
    LayoutConfig, LayoutRecord, LayoutType, Pane, PaneStatus, Result, TermspaceError,
};

use crate::clock::Clock;
use crate::storage::SessionStore;

pub struct LayoutEngine {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl LayoutEngine {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The workspace's default layout, created as `single` on first use.
    pub async fn get_default_layout(&self, workspace_id: &str) -> Result<LayoutRecord> {
        if let Some(layout) = self.store.get_default_layout(workspace_id).await? {
            return Ok(layout);
        }

        let now = self.clock.now();
        let layout = LayoutRecord {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            name: "Default".to_string(),
            layout_type: LayoutType::Single,
            is_default: true,
            configuration: LayoutConfig {
                layout_type: LayoutType::Single,
                panes: pane_templates(LayoutType::Single),
            },
            created_at: now,
            updated_at: now,
        };
        self.store.insert_layout(&layout).await?;
        info!("Created default layout for workspace {}", workspace_id);
        Ok(layout)
    }

    pub async fn create_layout(
        &self,
        workspace_id: &str,
        name: &str,
        layout_type: LayoutType,
        configuration: Option<LayoutConfig>,
    ) -> Result<LayoutRecord> {
        let now = self.clock.now();
        let layout = LayoutRecord {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            layout_type,
            is_default: false,
            configuration: configuration.unwrap_or_else(|| LayoutConfig {
                layout_type,
                panes: pane_templates(layout_type),
            }),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_layout(&layout).await?;
        Ok(layout)
    }

    /// Append a session to the first pane and make it the active tab.
    pub async fn add_session_to_layout(
        &self,
        layout_id: &str,
        session_id: &str,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            strip_session(config, session_id);
            let pane = config
                .panes
                .first_mut()
                .ok_or_else(|| TermspaceError::PaneNotFound(layout_id.to_string()))?;
            pane.tabs.push(session_id.to_string());
            pane.active_tab_id = Some(session_id.to_string());
            pane.status = PaneStatus::Active;
            Ok(())
        })
        .await
    }

    /// Remove a session from every pane it appears in.
    pub async fn remove_session_from_layout(
        &self,
        layout_id: &str,
        session_id: &str,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            strip_session(config, session_id);
            Ok(())
        })
        .await
    }

    pub async fn set_active_pane_tab(
        &self,
        layout_id: &str,
        pane_id: &str,
        session_id: &str,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            let pane = find_pane(config, pane_id)?;
            if !pane.tabs.iter().any(|t| t == session_id) {
                return Err(TermspaceError::TabNotInPane {
                    session_id: session_id.to_string(),
                    pane_id: pane_id.to_string(),
                });
            }
            pane.active_tab_id = Some(session_id.to_string());
            pane.status = PaneStatus::Active;
            Ok(())
        })
        .await
    }

    /// Rewrite the default layout to `layout_type`, distributing the
    /// sessions round-robin: pane `i` of `n` receives sessions at
    /// positions `i, i+n, i+2n, ...`.
    pub async fn create_split_layout(
        &self,
        workspace_id: &str,
        layout_type: LayoutType,
        session_ids: &[String],
    ) -> Result<LayoutRecord> {
        let mut layout = self.get_default_layout(workspace_id).await?;
        let mut panes = pane_templates(layout_type);
        let pane_count = panes.len();

        for (index, session_id) in session_ids.iter().enumerate() {
            panes[index % pane_count].tabs.push(session_id.clone());
        }
        for pane in &mut panes {
            pane.normalize();
        }

        layout.layout_type = layout_type;
        layout.configuration = LayoutConfig { layout_type, panes };
        layout.updated_at = self.clock.now();
        self.store.update_layout(&layout).await?;
        Ok(layout)
    }

    /// Rewrite the default layout to a single pane holding every given
    /// session, in order.
    pub async fn convert_to_single(
        &self,
        workspace_id: &str,
        session_ids: &[String],
    ) -> Result<LayoutRecord> {
        let mut layout = self.get_default_layout(workspace_id).await?;
        let mut panes = pane_templates(LayoutType::Single);
        panes[0].tabs = session_ids.to_vec();
        panes[0].normalize();

        layout.layout_type = LayoutType::Single;
        layout.configuration = LayoutConfig {
            layout_type: LayoutType::Single,
            panes,
        };
        layout.updated_at = self.clock.now();
        self.store.update_layout(&layout).await?;
        Ok(layout)
    }

    pub async fn move_tab_between_panes(
        &self,
        layout_id: &str,
        session_id: &str,
        source_pane_id: &str,
        target_pane_id: &str,
        target_index: Option<usize>,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            let source = find_pane(config, source_pane_id)?;
            let Some(position) = source.tabs.iter().position(|t| t == session_id) else {
                return Err(TermspaceError::TabNotInPane {
                    session_id: session_id.to_string(),
                    pane_id: source_pane_id.to_string(),
                });
            };
            source.tabs.remove(position);
            source.normalize();

            let target = find_pane(config, target_pane_id)?;
            let index = target_index
                .unwrap_or(target.tabs.len())
                .min(target.tabs.len());
            target.tabs.insert(index, session_id.to_string());
            target.active_tab_id = Some(session_id.to_string());
            target.status = PaneStatus::Active;
            Ok(())
        })
        .await
    }

    pub async fn add_tab_to_pane(
        &self,
        layout_id: &str,
        pane_id: &str,
        session_id: &str,
        set_active: bool,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            strip_session(config, session_id);
            let pane = find_pane(config, pane_id)?;
            pane.tabs.push(session_id.to_string());
            if set_active {
                pane.active_tab_id = Some(session_id.to_string());
            }
            pane.normalize();
            Ok(())
        })
        .await
    }

    pub async fn remove_tab_from_pane(
        &self,
        layout_id: &str,
        pane_id: &str,
        session_id: &str,
    ) -> Result<LayoutRecord> {
        self.mutate(layout_id, |config| {
            let pane = find_pane(config, pane_id)?;
            pane.tabs.retain(|t| t != session_id);
            pane.normalize();
            Ok(())
        })
        .await
    }

    /// Best-effort removal of every layout a workspace owns.
    pub async fn cleanup_workspace_layouts(&self, workspace_id: &str) {
        match self.store.delete_workspace_layouts(workspace_id).await {
            Ok(count) => info!(
                "Deleted {} layouts for workspace {}",
                count, workspace_id
            ),
            Err(e) => warn!(
                "Failed to delete layouts for workspace {}: {}",
                workspace_id, e
            ),
        }
    }

    async fn mutate<F>(&self, layout_id: &str, apply: F) -> Result<LayoutRecord>
    where
        F: FnOnce(&mut LayoutConfig) -> Result<()>,
    {
        let Some(mut layout) = self.store.get_layout(layout_id).await? else {
            return Err(TermspaceError::LayoutNotFound(layout_id.to_string()));
        };
        apply(&mut layout.configuration)?;
        layout.updated_at = self.clock.now();
        self.store.update_layout(&layout).await?;
        Ok(layout)
    }
}

fn find_pane<'a>(config: &'a mut LayoutConfig, pane_id: &str) -> Result<&'a mut Pane> {
    config
        .panes
        .iter_mut()
        .find(|p| p.id == pane_id)
        .ok_or_else(|| TermspaceError::PaneNotFound(pane_id.to_string()))
}

/// Drop a session from every pane, fixing the panes it left.
fn strip_session(config: &mut LayoutConfig, session_id: &str) {
    for pane in &mut config.panes {
        if pane.tabs.iter().any(|t| t == session_id) {
            pane.tabs.retain(|t| t != session_id);
            pane.normalize();
        }
    }
}

/// The pane skeleton for each layout type.
pub fn pane_templates(layout_type: LayoutType) -> Vec<Pane> {
    let specs: &[(&str, &str)] = match layout_type {
        LayoutType::Single => &[("main", "1 / 1 / 2 / 2")],
        LayoutType::HorizontalSplit => &[("left", "1 / 1 / 2 / 2"), ("right", "1 / 2 / 2 / 3")],
        LayoutType::VerticalSplit => &[("top", "1 / 1 / 2 / 2"), ("bottom", "2 / 1 / 3 / 2")],
        LayoutType::ThreePane => &[
            ("main", "1 / 1 / 3 / 2"),
            ("top-right", "1 / 2 / 2 / 3"),
            ("bottom-right", "2 / 2 / 3 / 3"),
        ],
        LayoutType::Grid2x2 => &[
            ("top-left", "1 / 1 / 2 / 2"),
            ("top-right", "1 / 2 / 2 / 3"),
            ("bottom-left", "2 / 1 / 3 / 2"),
            ("bottom-right", "2 / 2 / 3 / 3"),
        ],
    };

    specs
        .iter()
        .enumerate()
        .map(|(index, (position, grid_area))| Pane {
            id: format!("pane-{}", index + 1),
            position: position.to_string(),
            grid_area: grid_area.to_string(),
            tabs: Vec::new(),
            active_tab_id: None,
            status: PaneStatus::Pending,
        })
        .collect()
}

/// Which split layouts a viewport can host. Mobile gets `single` only,
/// tablets the two-way splits, desktop everything.
pub fn is_split_layout_supported(viewport_width: u32, layout_type: LayoutType) -> bool {
    if viewport_width <= 768 {
        layout_type == LayoutType::Single
    } else if viewport_width <= 1024 {
        matches!(
            layout_type,
            LayoutType::Single | LayoutType::HorizontalSplit | LayoutType::VerticalSplit
        )
    } else {
        true
    }
}

pub fn get_recommended_layout(viewport_width: u32, session_count: usize) -> LayoutType {
    if viewport_width <= 768 {
        LayoutType::Single
    } else if viewport_width <= 1024 {
        if session_count >= 2 {
            LayoutType::HorizontalSplit
        } else {
            LayoutType::Single
        }
    } else {
        match session_count {
            0 | 1 => LayoutType::Single,
            2 => LayoutType::HorizontalSplit,
            3 => LayoutType::ThreePane,
            _ => LayoutType::Grid2x2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::MemoryStore;

    fn engine() -> LayoutEngine {
        LayoutEngine::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    /// A session appears in at most one pane; a non-empty pane's active
    /// tab is one of its tabs; an empty pane is pending.
    fn assert_consistent(layout: &LayoutRecord) {
        let mut seen = std::collections::HashSet::new();
        for pane in &layout.configuration.panes {
            for tab in &pane.tabs {
                assert!(seen.insert(tab.clone()), "tab {tab} assigned twice");
            }
            if pane.tabs.is_empty() {
                assert_eq!(pane.active_tab_id, None);
                assert_eq!(pane.status, PaneStatus::Pending);
            } else if let Some(active) = &pane.active_tab_id {
                assert!(pane.tabs.contains(active));
            }
        }
    }

    #[tokio::test]
    async fn test_default_layout_created_lazily() {
        let engine = engine();
        let first = engine.get_default_layout("w1").await.unwrap();
        assert!(first.is_default);
        assert_eq!(first.layout_type, LayoutType::Single);
        let second = engine.get_default_layout("w1").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_split_round_robin() {
        let engine = engine();
        let layout = engine
            .create_split_layout(
                "w1",
                LayoutType::Grid2x2,
                &ids(&["s1", "s2", "s3", "s4", "s5", "s6"]),
            )
            .await
            .unwrap();

        let panes = &layout.configuration.panes;
        assert_eq!(panes[0].tabs, ids(&["s1", "s5"]));
        assert_eq!(panes[1].tabs, ids(&["s2", "s6"]));
        assert_eq!(panes[2].tabs, ids(&["s3"]));
        assert_eq!(panes[3].tabs, ids(&["s4"]));
        assert_eq!(panes[0].active_tab_id.as_deref(), Some("s1"));
        assert_eq!(panes[1].active_tab_id.as_deref(), Some("s2"));
        assert_eq!(panes[2].active_tab_id.as_deref(), Some("s3"));
        assert_eq!(panes[3].active_tab_id.as_deref(), Some("s4"));
        assert_consistent(&layout);
    }

    #[tokio::test]
    async fn test_split_with_fewer_sessions_than_panes() {
        let engine = engine();
        let layout = engine
            .create_split_layout("w1", LayoutType::ThreePane, &ids(&["s1"]))
            .await
            .unwrap();
        let panes = &layout.configuration.panes;
        assert_eq!(panes[0].tabs, ids(&["s1"]));
        assert!(panes[1].tabs.is_empty());
        assert_eq!(panes[1].status, PaneStatus::Pending);
        assert_consistent(&layout);
    }

    #[tokio::test]
    async fn test_convert_to_single_flattens() {
        let engine = engine();
        engine
            .create_split_layout("w1", LayoutType::HorizontalSplit, &ids(&["s1", "s2", "s3"]))
            .await
            .unwrap();
        let layout = engine
            .convert_to_single("w1", &ids(&["s1", "s2", "s3"]))
            .await
            .unwrap();
        assert_eq!(layout.layout_type, LayoutType::Single);
        assert_eq!(layout.configuration.panes[0].tabs, ids(&["s1", "s2", "s3"]));
        assert_eq!(
            layout.configuration.panes[0].active_tab_id.as_deref(),
            Some("s1")
        );
        assert_consistent(&layout);
    }

    #[tokio::test]
    async fn test_add_and_remove_session() {
        let engine = engine();
        let layout = engine.get_default_layout("w1").await.unwrap();

        let layout = engine
            .add_session_to_layout(&layout.id, "s1")
            .await
            .unwrap();
        let layout = engine
            .add_session_to_layout(&layout.id, "s2")
            .await
            .unwrap();
        assert_eq!(layout.configuration.panes[0].tabs, ids(&["s1", "s2"]));
        assert_eq!(
            layout.configuration.panes[0].active_tab_id.as_deref(),
            Some("s2")
        );

        // Removing the active tab falls back to the first remaining one.
        let layout = engine
            .remove_session_from_layout(&layout.id, "s2")
            .await
            .unwrap();
        assert_eq!(
            layout.configuration.panes[0].active_tab_id.as_deref(),
            Some("s1")
        );

        let layout = engine
            .remove_session_from_layout(&layout.id, "s1")
            .await
            .unwrap();
        assert_eq!(layout.configuration.panes[0].status, PaneStatus::Pending);
        assert_consistent(&layout);
    }

    #[tokio::test]
    async fn test_move_tab_between_panes() {
        let engine = engine();
        let layout = engine
            .create_split_layout("w1", LayoutType::HorizontalSplit, &ids(&["s1", "s2", "s3"]))
            .await
            .unwrap();
        // s1,s3 in pane-1; s2 in pane-2.
        let layout = engine
            .move_tab_between_panes(&layout.id, "s1", "pane-1", "pane-2", Some(0))
            .await
            .unwrap();

        let panes = &layout.configuration.panes;
        assert_eq!(panes[0].tabs, ids(&["s3"]));
        assert_eq!(panes[0].active_tab_id.as_deref(), Some("s3"));
        assert_eq!(panes[1].tabs, ids(&["s1", "s2"]));
        assert_eq!(panes[1].active_tab_id.as_deref(), Some("s1"));
        assert_consistent(&layout);

        let err = engine
            .move_tab_between_panes(&layout.id, "s2", "pane-1", "pane-2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TermspaceError::TabNotInPane { .. }));
    }

    #[tokio::test]
    async fn test_set_active_requires_membership() {
        let engine = engine();
        let layout = engine
            .create_split_layout("w1", LayoutType::HorizontalSplit, &ids(&["s1", "s2"]))
            .await
            .unwrap();

        let err = engine
            .set_active_pane_tab(&layout.id, "pane-1", "s2")
            .await
            .unwrap_err();
        assert!(matches!(err, TermspaceError::TabNotInPane { .. }));

        let layout = engine
            .set_active_pane_tab(&layout.id, "pane-1", "s1")
            .await
            .unwrap();
        assert_eq!(
            layout.configuration.panes[0].active_tab_id.as_deref(),
            Some("s1")
        );

        let err = engine
            .set_active_pane_tab(&layout.id, "pane-9", "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, TermspaceError::PaneNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_tab_to_pane_keeps_single_assignment() {
        let engine = engine();
        let layout = engine
            .create_split_layout("w1", LayoutType::HorizontalSplit, &ids(&["s1", "s2"]))
            .await
            .unwrap();

        // Re-adding an assigned session moves it rather than duplicating.
        let layout = engine
            .add_tab_to_pane(&layout.id, "pane-2", "s1", true)
            .await
            .unwrap();
        assert!(layout.configuration.panes[0].tabs.is_empty());
        assert_eq!(layout.configuration.panes[1].tabs, ids(&["s2", "s1"]));
        assert_consistent(&layout);
    }

    #[test]
    fn test_pane_templates_match_spec() {
        assert_eq!(pane_templates(LayoutType::Single).len(), 1);
        assert_eq!(pane_templates(LayoutType::HorizontalSplit).len(), 2);
        assert_eq!(pane_templates(LayoutType::VerticalSplit).len(), 2);
        assert_eq!(pane_templates(LayoutType::ThreePane).len(), 3);
        assert_eq!(pane_templates(LayoutType::Grid2x2).len(), 4);

        let positions: Vec<String> = pane_templates(LayoutType::ThreePane)
            .iter()
            .map(|p| p.position.clone())
            .collect();
        assert_eq!(positions, vec!["main", "top-right", "bottom-right"]);
    }

    #[test]
    fn test_responsive_helpers() {
        assert!(is_split_layout_supported(600, LayoutType::Single));
        assert!(!is_split_layout_supported(600, LayoutType::HorizontalSplit));
        assert!(is_split_layout_supported(900, LayoutType::VerticalSplit));
        assert!(!is_split_layout_supported(900, LayoutType::Grid2x2));
        assert!(is_split_layout_supported(1400, LayoutType::Grid2x2));

        assert_eq!(get_recommended_layout(600, 4), LayoutType::Single);
        assert_eq!(get_recommended_layout(900, 1), LayoutType::Single);
        assert_eq!(get_recommended_layout(900, 3), LayoutType::HorizontalSplit);
        assert_eq!(get_recommended_layout(1400, 1), LayoutType::Single);
        assert_eq!(get_recommended_layout(1400, 2), LayoutType::HorizontalSplit);
        assert_eq!(get_recommended_layout(1400, 3), LayoutType::ThreePane);
        assert_eq!(get_recommended_layout(1400, 6), LayoutType::Grid2x2);
    }
}
