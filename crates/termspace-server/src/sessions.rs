//! Session manager
//!
//! Authoritative lifecycle for sessions: creation, socket attach/detach,
//! typed state patches, recovery-token resolution, idle expiry, and the
//! periodic cleanup tick. The in-memory caches here are projections of
//! the store and are rebuilt from it on construction.
//!
//! Idle timeouts live in a single time-ordered heap rather than one
//! timer per session; re-arming replaces the previous entry for that
//! session via a generation counter.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use termspace_core::{
    Result, SessionPatch, SessionRecord, SessionStatus, TermspaceError, TerminalSize,
    TerminationReason, DEFAULT_MAX_IDLE_MINUTES,
};

use crate::clock::Clock;
use crate::storage::SessionStore;
use crate::supervisor::pid_alive;

/// How often the manager fires due idle timers and sweeps stale rows.
const CLEANUP_TICK: Duration = Duration::from_secs(60);

/// Sessions untouched for this long are terminated by the tick.
const STALE_SESSION_HOURS: i64 = 24;

/// Active sessions idle longer than this count as idle in statistics.
const IDLE_STATISTICS_MINUTES: i64 = 30;

const RECOVERY_TOKEN_LEN: usize = 48;

/// Emitted on every termination so interested parties (the PTY
/// multiplexer) can release the session's runtime. The manager never
/// calls back into live PTYs.
#[derive(Debug, Clone)]
pub struct SessionLifecycleEvent {
    pub session_id: String,
    pub workspace_id: String,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub session_id: Option<String>,
    pub socket_id: Option<String>,
    pub terminal_size: TerminalSize,
    pub session_name: String,
    pub is_default: bool,
    pub session_timeout: Option<i64>,
    pub max_idle_time: Option<i64>,
    pub auto_cleanup: bool,
    pub can_recover: bool,
}

impl Default for CreateSessionOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            socket_id: None,
            terminal_size: TerminalSize::default(),
            session_name: "Terminal".to_string(),
            is_default: false,
            session_timeout: None,
            max_idle_time: None,
            auto_cleanup: true,
            can_recover: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub active: i64,
    pub paused: i64,
    pub terminated: i64,
    pub recoverable: i64,
    pub idle: i64,
    pub cached_sessions: usize,
    pub tracked_tokens: usize,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    /// Advisory cache of non-terminated sessions.
    active_sessions: Arc<DashMap<String, SessionRecord>>,
    /// recovery token -> session id, for non-terminated sessions only.
    recovery_tokens: Arc<DashMap<String, String>>,
    idle_timeouts: Arc<StdMutex<IdleQueue>>,
    lifecycle_tx: broadcast::Sender<SessionLifecycleEvent>,
    tick_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionManager {
    /// Construct and reconcile with the store: active sessions with a
    /// recovery token prime the token map and cache. Reconcile failures
    /// are logged and treated as "no cached state"; the store remains
    /// the source of truth.
    pub async fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(64);
        let manager = Self {
            store,
            clock,
            active_sessions: Arc::new(DashMap::new()),
            recovery_tokens: Arc::new(DashMap::new()),
            idle_timeouts: Arc::new(StdMutex::new(IdleQueue::default())),
            lifecycle_tx,
            tick_handle: Arc::new(Mutex::new(None)),
        };

        match manager
            .store
            .list_sessions_by_status(&[SessionStatus::Active])
            .await
        {
            Ok(sessions) => {
                for session in sessions {
                    if session.recovery_token.is_empty() {
                        continue;
                    }
                    manager
                        .recovery_tokens
                        .insert(session.recovery_token.clone(), session.id.clone());
                    manager
                        .active_sessions
                        .insert(session.id.clone(), session);
                }
                info!(
                    "Session manager reconciled {} active sessions",
                    manager.active_sessions.len()
                );
            }
            Err(e) => {
                error!("Session reconcile failed, starting with empty caches: {}", e);
            }
        }

        manager
    }

    /// Begin the periodic cleanup tick.
    pub async fn start(&self) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.fire_due_idle_timeouts().await;
                manager.perform_session_cleanup().await;
            }
        });
        *self.tick_handle.lock().await = Some(handle);
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionLifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub async fn create_session(
        &self,
        workspace_id: &str,
        shell_pid: Option<u32>,
        opts: CreateSessionOptions,
    ) -> Result<SessionRecord> {
        let now = self.clock.now();
        let id = opts
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let recovery_token = generate_recovery_token();
        let max_idle_time = opts.max_idle_time.unwrap_or(DEFAULT_MAX_IDLE_MINUTES);

        let session = SessionRecord {
            id: id.clone(),
            workspace_id: workspace_id.to_string(),
            recovery_token: recovery_token.clone(),
            session_name: opts.session_name,
            is_default_session: opts.is_default,
            session_type: "terminal".to_string(),
            shell_pid,
            socket_id: opts.socket_id,
            status: SessionStatus::Active,
            current_working_dir: None,
            environment_vars: None,
            terminal_size: Some(opts.terminal_size.encode()),
            last_command: None,
            shell_history: Vec::new(),
            session_timeout: opts.session_timeout,
            max_idle_time,
            auto_cleanup: opts.auto_cleanup,
            can_recover: opts.can_recover,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
        };

        self.store.insert_session(&session).await?;
        self.recovery_tokens.insert(recovery_token, id.clone());
        self.active_sessions.insert(id.clone(), session.clone());
        self.setup_idle_timeout(&id, max_idle_time);

        info!(
            "Created session {} (workspace: {}, pid: {:?})",
            id, workspace_id, shell_pid
        );
        Ok(session)
    }

    /// Apply typed patches to mutable session state. Also appends any
    /// patched command to the bounded shell history, refreshes the
    /// activity timestamp, and re-arms the idle timer.
    pub async fn update_session_state(
        &self,
        id: &str,
        patches: &[SessionPatch],
    ) -> Result<SessionRecord> {
        let mut session = self.require_live_session(id).await?;
        let now = self.clock.now();

        for patch in patches {
            session.apply_patch(patch);
            if let SessionPatch::LastCommand(command) = patch {
                session.push_shell_history(command, now);
            }
        }
        session.last_activity_at = now;

        self.store.update_session(&session).await?;
        self.active_sessions.insert(id.to_string(), session.clone());
        self.setup_idle_timeout(id, session.max_idle_time);
        Ok(session)
    }

    pub async fn attach_socket_to_session(
        &self,
        id: &str,
        socket_id: &str,
    ) -> Result<SessionRecord> {
        let mut session = self.require_live_session(id).await?;
        session.socket_id = Some(socket_id.to_string());
        session.status = SessionStatus::Active;
        session.last_activity_at = self.clock.now();

        self.store.update_session(&session).await?;
        self.active_sessions.insert(id.to_string(), session.clone());
        self.setup_idle_timeout(id, session.max_idle_time);
        debug!("Socket {} attached to session {}", socket_id, id);
        Ok(session)
    }

    /// Pause a session that lost its last client. The idle timer keeps
    /// running so paused sessions still expire.
    pub async fn detach_socket_from_session(&self, id: &str) -> Result<SessionRecord> {
        let Some(mut session) = self.load_session(id).await? else {
            return Err(TermspaceError::SessionNotFound(id.to_string()));
        };
        if session.is_terminated() {
            debug!("Detach on terminated session {} ignored", id);
            return Ok(session);
        }

        session.socket_id = None;
        session.status = SessionStatus::Paused;
        session.last_activity_at = self.clock.now();

        self.store.update_session(&session).await?;
        self.active_sessions.insert(id.to_string(), session.clone());
        debug!("Session {} paused", id);
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.load_session(id).await
    }

    pub async fn find_session_by_recovery_token(&self, token: &str) -> Option<SessionRecord> {
        let id = self.recovery_tokens.get(token).map(|id| id.clone())?;
        match self.store.get_session(&id).await {
            Ok(Some(session)) if !session.is_terminated() => Some(session),
            Ok(_) => {
                // Stale map entry: terminated or deleted underneath us.
                self.recovery_tokens.remove(token);
                None
            }
            Err(e) => {
                warn!("Recovery token lookup failed for session {}: {}", id, e);
                None
            }
        }
    }

    pub async fn find_recoverable_session(&self, workspace_id: &str) -> Option<SessionRecord> {
        match self.store.find_recoverable_session(workspace_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "Recoverable session lookup failed for workspace {}: {}",
                    workspace_id, e
                );
                None
            }
        }
    }

    /// Record the PID of a freshly spawned shell for a recovered session.
    pub async fn record_shell_pid(&self, id: &str, shell_pid: u32) -> Result<SessionRecord> {
        let mut session = self.require_live_session(id).await?;
        session.shell_pid = Some(shell_pid);
        session.last_activity_at = self.clock.now();
        self.store.update_session(&session).await?;
        self.active_sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    /// Terminate a session. Idempotent: a second call, or an attach after
    /// termination, is a no-op / failure respectively.
    pub async fn terminate_session(&self, id: &str, reason: TerminationReason) -> Result<()> {
        let Some(mut session) = self.load_session(id).await? else {
            return Err(TermspaceError::SessionNotFound(id.to_string()));
        };
        if session.is_terminated() {
            return Ok(());
        }

        session.status = SessionStatus::Terminated;
        session.ended_at = Some(self.clock.now());
        session.socket_id = None;
        session.can_recover = false;
        self.store.update_session(&session).await?;

        self.active_sessions.remove(id);
        self.recovery_tokens.remove(&session.recovery_token);
        self.idle_timeouts.lock().unwrap().cancel(id);

        info!("Terminated session {} (reason: {})", id, reason.as_str());
        let _ = self.lifecycle_tx.send(SessionLifecycleEvent {
            session_id: id.to_string(),
            workspace_id: session.workspace_id.clone(),
            reason,
        });
        Ok(())
    }

    /// Arm (or re-arm) the idle timer for a session. The previous entry
    /// for the session, if any, is superseded.
    pub fn setup_idle_timeout(&self, id: &str, minutes: i64) {
        let after = Duration::from_secs((minutes.max(0) as u64) * 60);
        self.idle_timeouts.lock().unwrap().arm(id, after);
    }

    /// Restart reconciliation: prior-run `active` rows represent PTYs
    /// that no longer exist and cannot be re-attached.
    pub async fn reconcile_restart(&self) -> Result<u64> {
        let count = self
            .store
            .mark_all_active_terminated(self.clock.now())
            .await?;
        self.active_sessions.clear();
        self.recovery_tokens.clear();
        self.idle_timeouts.lock().unwrap().clear();
        Ok(count)
    }

    /// One pass of the stale-session sweep plus orphaned-process repair.
    pub async fn perform_session_cleanup(&self) {
        let cutoff = self.clock.now() - ChronoDuration::hours(STALE_SESSION_HOURS);
        match self.store.list_cleanup_candidates(cutoff).await {
            Ok(candidates) => {
                for session in candidates {
                    if let Err(e) = self
                        .terminate_session(&session.id, TerminationReason::CleanupExpired)
                        .await
                    {
                        warn!("Failed to expire session {}: {}", session.id, e);
                    }
                }
            }
            Err(e) => warn!("Session cleanup query failed: {}", e),
        }

        self.cleanup_orphaned_processes().await;
    }

    /// Supervisor rows pointing at a dead PID and a missing or terminated
    /// session are marked crashed.
    pub async fn cleanup_orphaned_processes(&self) {
        let rows = match self.store.list_running_processes().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Orphaned process query failed: {}", e);
                return;
            }
        };

        for mut row in rows {
            let Some(session_id) = row.session_id.clone() else {
                continue;
            };
            let session_gone = match self.store.get_session(&session_id).await {
                Ok(Some(session)) => session.is_terminated(),
                Ok(None) => true,
                Err(_) => false,
            };
            if session_gone && !pid_alive(row.pid) {
                row.status = termspace_core::ProcessStatus::Crashed;
                row.ended_at = Some(self.clock.now());
                if let Err(e) = self.store.update_process(&row).await {
                    warn!("Failed to mark orphaned process {} crashed: {}", row.id, e);
                } else {
                    info!("Marked orphaned process {} as crashed", row.id);
                }
            }
        }
    }

    pub async fn get_session_statistics(&self) -> Option<SessionStatistics> {
        let result: Result<SessionStatistics> = async {
            let counts = self.store.count_sessions_by_status().await?;
            let by_status = |status: SessionStatus| {
                counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map(|(_, n)| *n)
                    .unwrap_or(0)
            };
            let recoverable = self.store.count_recoverable_sessions().await?;
            let idle_cutoff =
                self.clock.now() - ChronoDuration::minutes(IDLE_STATISTICS_MINUTES);
            let idle = self.store.count_idle_sessions(idle_cutoff).await?;

            Ok(SessionStatistics {
                active: by_status(SessionStatus::Active),
                paused: by_status(SessionStatus::Paused),
                terminated: by_status(SessionStatus::Terminated),
                recoverable,
                idle,
                cached_sessions: self.active_sessions.len(),
                tracked_tokens: self.recovery_tokens.len(),
            })
        }
        .await;

        match result {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Session statistics query failed: {}", e);
                None
            }
        }
    }

    /// Stop the tick, drop all timers and caches. No store writes.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.tick_handle.lock().await.take() {
            handle.abort();
        }
        self.idle_timeouts.lock().unwrap().clear();
        self.active_sessions.clear();
        self.recovery_tokens.clear();
    }

    async fn fire_due_idle_timeouts(&self) {
        let due = self.idle_timeouts.lock().unwrap().due(Instant::now());
        for id in due {
            let session = match self.load_session(&id).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Idle timer lookup failed for session {}: {}", id, e);
                    continue;
                }
            };
            if session.is_terminated() {
                continue;
            }
            if !session.auto_cleanup {
                debug!("Idle timer elapsed for {} but auto-cleanup is off", id);
                continue;
            }
            if let Err(e) = self
                .terminate_session(&id, TerminationReason::IdleTimeout)
                .await
            {
                warn!("Idle termination of session {} failed: {}", id, e);
            }
        }
    }

    async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        if let Some(session) = self.active_sessions.get(id) {
            return Ok(Some(session.clone()));
        }
        self.store.get_session(id).await
    }

    async fn require_live_session(&self, id: &str) -> Result<SessionRecord> {
        match self.load_session(id).await? {
            None => Err(TermspaceError::SessionNotFound(id.to_string())),
            Some(session) if session.is_terminated() => {
                Err(TermspaceError::SessionTerminated(id.to_string()))
            }
            Some(session) => Ok(session),
        }
    }
}

fn generate_recovery_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RECOVERY_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Time-ordered idle timers with generation-based cancellation.
#[derive(Default)]
struct IdleQueue {
    heap: BinaryHeap<Reverse<IdleEntry>>,
    generations: HashMap<String, u64>,
    next_generation: u64,
}

#[derive(PartialEq, Eq)]
struct IdleEntry {
    deadline: Instant,
    generation: u64,
    session_id: String,
}

impl Ord for IdleEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for IdleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl IdleQueue {
    fn arm(&mut self, session_id: &str, after: Duration) {
        self.next_generation += 1;
        self.generations
            .insert(session_id.to_string(), self.next_generation);
        self.heap.push(Reverse(IdleEntry {
            deadline: Instant::now() + after,
            generation: self.next_generation,
            session_id: session_id.to_string(),
        }));
    }

    fn cancel(&mut self, session_id: &str) {
        self.generations.remove(session_id);
    }

    /// Pop every entry due at `now`; superseded and cancelled entries are
    /// discarded on the way.
    fn due(&mut self, now: Instant) -> Vec<String> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.generations.get(&entry.session_id) == Some(&entry.generation) {
                self.generations.remove(&entry.session_id);
                fired.push(entry.session_id);
            }
        }
        fired
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.generations.clear();
    }
}
