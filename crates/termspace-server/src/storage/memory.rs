//! In-memory store using DashMap
//!
//! Implements the full `SessionStore` surface so the session substrate
//! can be exercised without SQLite.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use termspace_core::{
    CsrfTokenRecord, LayoutRecord, RateLimitRecord, Result, SessionRecord, SessionStatus,
    UserProcessRecord,
};

use super::SessionStore;

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, SessionRecord>,
    layouts: DashMap<String, LayoutRecord>,
    processes: DashMap<String, UserProcessRecord>,
    csrf_tokens: DashMap<String, CsrfTokenRecord>,
    rate_limits: DashMap<i64, RateLimitRecord>,
    next_rate_limit_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| statuses.contains(&s.status))
            .map(|s| s.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn find_recoverable_session(
        &self,
        workspace_id: &str,
    ) -> Result<Option<SessionRecord>> {
        let mut candidates: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| {
                s.workspace_id == workspace_id
                    && s.can_recover
                    && matches!(s.status, SessionStatus::Active | SessionStatus::Paused)
            })
            .map(|s| s.clone())
            .collect();
        candidates.sort_by_key(|s| std::cmp::Reverse(s.last_activity_at));
        Ok(candidates.into_iter().next())
    }

    async fn list_cleanup_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| {
                s.auto_cleanup
                    && matches!(s.status, SessionStatus::Active | SessionStatus::Paused)
                    && s.last_activity_at < cutoff
            })
            .map(|s| s.clone())
            .collect())
    }

    async fn mark_all_active_terminated(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut count = 0;
        for mut session in self.sessions.iter_mut() {
            if session.status == SessionStatus::Active {
                session.status = SessionStatus::Terminated;
                session.ended_at = Some(now);
                session.socket_id = None;
                session.can_recover = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_sessions_by_status(&self) -> Result<Vec<(SessionStatus, i64)>> {
        let mut counts: std::collections::HashMap<SessionStatus, i64> =
            std::collections::HashMap::new();
        for session in self.sessions.iter() {
            *counts.entry(session.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn count_recoverable_sessions(&self) -> Result<i64> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| {
                s.can_recover
                    && matches!(s.status, SessionStatus::Active | SessionStatus::Paused)
            })
            .count() as i64)
    }

    async fn count_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active && s.last_activity_at < cutoff)
            .count() as i64)
    }

    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| match s.status {
                SessionStatus::Terminated => {
                    s.ended_at.map(|t| t < cutoff).unwrap_or(false)
                }
                SessionStatus::Paused => s.last_activity_at < cutoff,
                SessionStatus::Active => false,
            })
            .map(|s| s.id.clone())
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            self.sessions.remove(&id);
        }
        Ok(count)
    }

    async fn insert_layout(&self, layout: &LayoutRecord) -> Result<()> {
        self.layouts.insert(layout.id.clone(), layout.clone());
        Ok(())
    }

    async fn get_layout(&self, id: &str) -> Result<Option<LayoutRecord>> {
        Ok(self.layouts.get(id).map(|l| l.clone()))
    }

    async fn update_layout(&self, layout: &LayoutRecord) -> Result<()> {
        self.layouts.insert(layout.id.clone(), layout.clone());
        Ok(())
    }

    async fn get_default_layout(&self, workspace_id: &str) -> Result<Option<LayoutRecord>> {
        Ok(self
            .layouts
            .iter()
            .find(|l| l.workspace_id == workspace_id && l.is_default)
            .map(|l| l.clone()))
    }

    async fn delete_workspace_layouts(&self, workspace_id: &str) -> Result<u64> {
        let ids: Vec<String> = self
            .layouts
            .iter()
            .filter(|l| l.workspace_id == workspace_id)
            .map(|l| l.id.clone())
            .collect();
        let count = ids.len() as u64;
        for id in ids {
            self.layouts.remove(&id);
        }
        Ok(count)
    }

    async fn insert_process(&self, process: &UserProcessRecord) -> Result<()> {
        self.processes.insert(process.id.clone(), process.clone());
        Ok(())
    }

    async fn get_process(&self, id: &str) -> Result<Option<UserProcessRecord>> {
        Ok(self.processes.get(id).map(|p| p.clone()))
    }

    async fn update_process(&self, process: &UserProcessRecord) -> Result<()> {
        self.processes.insert(process.id.clone(), process.clone());
        Ok(())
    }

    async fn list_processes(&self) -> Result<Vec<UserProcessRecord>> {
        let mut processes: Vec<UserProcessRecord> =
            self.processes.iter().map(|p| p.clone()).collect();
        processes.sort_by_key(|p| p.started_at);
        Ok(processes)
    }

    async fn list_running_processes(&self) -> Result<Vec<UserProcessRecord>> {
        Ok(self
            .processes
            .iter()
            .filter(|p| p.status == termspace_core::ProcessStatus::Running)
            .map(|p| p.clone())
            .collect())
    }

    async fn mark_all_running_stopped(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut count = 0;
        for mut process in self.processes.iter_mut() {
            if process.status == termspace_core::ProcessStatus::Running {
                process.status = termspace_core::ProcessStatus::Stopped;
                process.ended_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_dead_processes(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let dead: Vec<String> = self
            .processes
            .iter()
            .filter(|p| {
                p.status.is_dead() && p.ended_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|p| p.id.clone())
            .collect();
        let count = dead.len() as u64;
        for id in dead {
            self.processes.remove(&id);
        }
        Ok(count)
    }

    async fn insert_csrf_token(&self, token: &CsrfTokenRecord) -> Result<()> {
        self.csrf_tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn delete_expired_csrf_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<String> = self
            .csrf_tokens
            .iter()
            .filter(|t| t.expires_at < now)
            .map(|t| t.token.clone())
            .collect();
        let count = expired.len() as u64;
        for token in expired {
            self.csrf_tokens.remove(&token);
        }
        Ok(count)
    }

    async fn insert_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        let id = self.next_rate_limit_id.fetch_add(1, Ordering::SeqCst);
        let mut record = record.clone();
        record.id = id;
        self.rate_limits.insert(id, record);
        Ok(())
    }

    async fn delete_expired_rate_limits(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<i64> = self
            .rate_limits
            .iter()
            .filter(|r| r.expires_at < now)
            .map(|r| r.id)
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            self.rate_limits.remove(&id);
        }
        Ok(count)
    }
}
