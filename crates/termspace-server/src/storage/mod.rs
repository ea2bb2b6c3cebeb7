//! Storage layer
//!
//! Uses SQLite (embedded) behind the `SessionStore` capability; tests
//! substitute the DashMap-backed in-memory store. In-memory caches held
//! elsewhere are advisory projections; the store is the source of
//! truth after a restart.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use termspace_core::{
    CsrfTokenRecord, LayoutRecord, RateLimitRecord, Result, SessionRecord, SessionStatus,
    UserProcessRecord,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    // Sessions
    async fn insert_session(&self, session: &SessionRecord) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;
    async fn update_session(&self, session: &SessionRecord) -> Result<()>;
    async fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>>;
    /// Most recent non-terminated recoverable session of a workspace.
    async fn find_recoverable_session(&self, workspace_id: &str)
        -> Result<Option<SessionRecord>>;
    /// Auto-cleanup sessions in {active, paused} idle since before `cutoff`.
    async fn list_cleanup_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>>;
    /// Restart reconciliation: every `active` row becomes `terminated`.
    async fn mark_all_active_terminated(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn count_sessions_by_status(&self) -> Result<Vec<(SessionStatus, i64)>>;
    async fn count_recoverable_sessions(&self) -> Result<i64>;
    /// Active sessions whose last activity predates `cutoff`.
    async fn count_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<i64>;
    /// Retention: terminated rows ended before `cutoff`, plus paused rows
    /// idle since before `cutoff`.
    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // Layouts
    async fn insert_layout(&self, layout: &LayoutRecord) -> Result<()>;
    async fn get_layout(&self, id: &str) -> Result<Option<LayoutRecord>>;
    async fn update_layout(&self, layout: &LayoutRecord) -> Result<()>;
    async fn get_default_layout(&self, workspace_id: &str) -> Result<Option<LayoutRecord>>;
    async fn delete_workspace_layouts(&self, workspace_id: &str) -> Result<u64>;

    // User processes
    async fn insert_process(&self, process: &UserProcessRecord) -> Result<()>;
    async fn get_process(&self, id: &str) -> Result<Option<UserProcessRecord>>;
    async fn update_process(&self, process: &UserProcessRecord) -> Result<()>;
    async fn list_processes(&self) -> Result<Vec<UserProcessRecord>>;
    async fn list_running_processes(&self) -> Result<Vec<UserProcessRecord>>;
    async fn mark_all_running_stopped(&self, now: DateTime<Utc>) -> Result<u64>;
    /// Dead rows (stopped/crashed/killed) ended before `cutoff`.
    async fn delete_dead_processes(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // Auth stores: owned by the surrounding middleware, evicted here.
    async fn insert_csrf_token(&self, token: &CsrfTokenRecord) -> Result<()>;
    async fn delete_expired_csrf_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn insert_rate_limit(&self, record: &RateLimitRecord) -> Result<()>;
    async fn delete_expired_rate_limits(&self, now: DateTime<Utc>) -> Result<u64>;
}
