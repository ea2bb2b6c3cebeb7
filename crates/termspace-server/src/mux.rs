//! PTY multiplexer
//!
//! Owns the shell processes. One PTY per non-terminated session, any
//! number of sockets per PTY. Sockets attach to a workspace's sessions,
//! switch between them, disconnect without killing anything, and get
//! scrollback replayed on their first session visit after a workspace
//! change.
//!
//! Per session there is one pump task: it drains the PTY reader into the
//! history buffer and the workspace room, applies resizes, and detects
//! exit. Input and resize travel over channels so no caller ever blocks
//! on PTY I/O.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use termspace_core::command::{is_development_server, parse_command, should_track_command};
use termspace_core::{
    Result, SessionPatch, TermspaceError, TerminalSize, TerminationReason, Workspace,
};

use crate::history::SessionHistory;
use crate::layout::LayoutEngine;
use crate::sessions::{CreateSessionOptions, SessionLifecycleEvent, SessionManager};
use crate::supervisor::{pid_alive, ProcessSupervisor, TrackOptions};
use crate::transport::{workspace_room, ClientTransport, RecoveredState, ServerEvent, SocketId};
use crate::workspace::WorkspaceService;

/// Dead-PTY sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Floor between per-chunk session-state syncs on the output path.
const STATE_SYNC_FLOOR: Duration = Duration::from_secs(1);

const REPLAY_BANNER: &str = "\r\n\x1b[2m──── session history ────\x1b[0m\r\n";
const REPLAY_FOOTER: &str = "\r\n\x1b[2m──── end of history ────\x1b[0m\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    Resumed,
    Recovered,
    Created,
}

#[derive(Debug, Clone)]
pub struct AttachResult {
    pub session_id: String,
    pub kind: AttachKind,
}

struct SessionRuntime {
    session_id: String,
    workspace: Workspace,
    session_name: String,
    recovery_token: String,
    sockets: HashSet<SocketId>,
    history: Arc<SessionHistory>,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    resize_tx: mpsc::UnboundedSender<(u16, u16)>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    shell_pid: Option<u32>,
    /// Last time the output path synced session state to the store.
    state_sync: StdMutex<Instant>,
}

struct WorkspaceSessions {
    sessions: HashMap<String, SessionRuntime>,
    /// Session ids in creation order; drives default promotion.
    session_order: Vec<String>,
    default_session_id: Option<String>,
    layout_id: Option<String>,
}

impl WorkspaceSessions {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            session_order: Vec::new(),
            default_session_id: None,
            layout_id: None,
        }
    }

    fn remove_session(&mut self, session_id: &str) -> Option<SessionRuntime> {
        let runtime = self.sessions.remove(session_id)?;
        self.session_order.retain(|id| id != session_id);
        if self.default_session_id.as_deref() == Some(session_id) {
            self.default_session_id = self.session_order.first().cloned();
        }
        Some(runtime)
    }
}

#[derive(Debug, Clone)]
struct SocketAttachment {
    workspace_id: String,
    session_id: String,
}

#[derive(Default)]
struct MuxState {
    workspace_sessions: HashMap<String, WorkspaceSessions>,
    socket_to_session: HashMap<SocketId, SocketAttachment>,
    /// Sessions a socket has visited since it last switched workspaces;
    /// governs replay suppression.
    socket_session_history: HashMap<SocketId, HashSet<String>>,
}

struct MuxInner {
    sessions: SessionManager,
    layouts: Arc<LayoutEngine>,
    supervisor: ProcessSupervisor,
    workspaces: Arc<dyn WorkspaceService>,
    transport: Arc<dyn ClientTransport>,
    history_dir: PathBuf,
    state: RwLock<MuxState>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    lifecycle_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PtyMultiplexer {
    inner: Arc<MuxInner>,
}

impl PtyMultiplexer {
    pub fn new(
        sessions: SessionManager,
        layouts: Arc<LayoutEngine>,
        supervisor: ProcessSupervisor,
        workspaces: Arc<dyn WorkspaceService>,
        transport: Arc<dyn ClientTransport>,
        history_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                sessions,
                layouts,
                supervisor,
                workspaces,
                transport,
                history_dir,
                state: RwLock::new(MuxState::default()),
                sweep_handle: Mutex::new(None),
                lifecycle_handle: Mutex::new(None),
            }),
        }
    }

    /// Restart reconciliation plus the periodic dead-PTY sweep and the
    /// session-lifecycle listener.
    pub async fn start(&self) {
        match self.inner.sessions.reconcile_restart().await {
            Ok(count) => info!("Startup reconcile terminated {} stale sessions", count),
            Err(e) => error!("Startup reconcile failed, store left as-is: {}", e),
        }

        let mux = self.clone();
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                mux.sweep_dead_sessions().await;
            }
        });
        *self.inner.sweep_handle.lock().await = Some(sweep);

        let mux = self.clone();
        let mut lifecycle = self.inner.sessions.subscribe_lifecycle();
        let listener = tokio::spawn(async move {
            while let Ok(event) = lifecycle.recv().await {
                mux.handle_session_terminated(event).await;
            }
        });
        *self.inner.lifecycle_handle.lock().await = Some(listener);
    }

    /// Attach a socket to a workspace terminal, resuming, recovering, or
    /// creating the target session.
    pub async fn create_pty_for_socket(
        &self,
        socket_id: &str,
        workspace_id: Option<&str>,
        session_id: Option<&str>,
        recovery_token: Option<&str>,
    ) -> Result<AttachResult> {
        let previous = {
            let state = self.inner.state.read().await;
            state.socket_to_session.get(socket_id).cloned()
        };
        if previous.is_some() {
            self.detach_socket_internal(socket_id, false).await;
        }

        let workspace = match workspace_id {
            Some(id) => self
                .inner
                .workspaces
                .get_workspace(id)
                .await
                .ok_or_else(|| TermspaceError::WorkspaceNotFound(id.to_string()))?,
            None => self
                .inner
                .workspaces
                .list_workspaces()
                .await
                .into_iter()
                .next()
                .ok_or_else(|| {
                    TermspaceError::WorkspaceNotFound("no workspaces configured".to_string())
                })?,
        };

        let workspace_switch = previous
            .as_ref()
            .map(|p| p.workspace_id != workspace.id)
            .unwrap_or(true);
        if workspace_switch {
            if let Some(previous) = &previous {
                self.inner
                    .transport
                    .leave_room(socket_id, &workspace_room(&previous.workspace_id))
                    .await;
            }
            let mut state = self.inner.state.write().await;
            state
                .socket_session_history
                .insert(socket_id.to_string(), HashSet::new());
        }
        self.inner
            .transport
            .join_room(socket_id, &workspace_room(&workspace.id))
            .await;

        let layout = self.inner.layouts.get_default_layout(&workspace.id).await?;
        let target = {
            let mut state = self.inner.state.write().await;
            let entry = state
                .workspace_sessions
                .entry(workspace.id.clone())
                .or_insert_with(WorkspaceSessions::new);
            entry.layout_id = Some(layout.id.clone());

            match session_id {
                Some(id) => Some(id.to_string()),
                None => entry
                    .default_session_id
                    .clone()
                    .filter(|id| entry.sessions.contains_key(id)),
            }
        };

        // Resume if the target already lives in memory.
        if let Some(target_id) = &target {
            let in_memory = {
                let state = self.inner.state.read().await;
                state
                    .workspace_sessions
                    .get(&workspace.id)
                    .map(|ws| ws.sessions.contains_key(target_id))
                    .unwrap_or(false)
            };
            if in_memory {
                self.join_session(socket_id, &workspace.id, target_id, false)
                    .await?;
                return Ok(AttachResult {
                    session_id: target_id.clone(),
                    kind: AttachKind::Resumed,
                });
            }
        }

        // Try recovery by token, then by the requested session id.
        let recoverable = match recovery_token {
            Some(token) => self.inner.sessions.find_session_by_recovery_token(token).await,
            None => match &target {
                Some(id) => self.inner.sessions.get_session(id).await.unwrap_or_else(|e| {
                    warn!("Session lookup failed during recovery: {}", e);
                    None
                }),
                None => None,
            },
        };
        if let Some(row) = recoverable {
            if row.workspace_id == workspace.id && !row.is_terminated() {
                let session_id = self.recover_session(socket_id, &workspace, row).await?;
                return Ok(AttachResult {
                    session_id,
                    kind: AttachKind::Recovered,
                });
            }
        }

        let session_id = self
            .create_session_runtime(socket_id, &workspace, target.as_deref())
            .await?;
        Ok(AttachResult {
            session_id,
            kind: AttachKind::Created,
        })
    }

    /// Move a socket to another session it can see. Replay happens only
    /// on the first session visit after a workspace change.
    pub async fn switch_socket_to_session(
        &self,
        socket_id: &str,
        workspace_id: &str,
        session_id: &str,
    ) -> Result<()> {
        {
            let state = self.inner.state.read().await;
            let exists = state
                .workspace_sessions
                .get(workspace_id)
                .map(|ws| ws.sessions.contains_key(session_id))
                .unwrap_or(false);
            if !exists {
                return Err(TermspaceError::SessionNotFound(session_id.to_string()));
            }
        }

        let previous = {
            let state = self.inner.state.read().await;
            state.socket_to_session.get(socket_id).cloned()
        };
        let workspace_switch = previous
            .as_ref()
            .map(|p| p.workspace_id != workspace_id)
            .unwrap_or(true);

        if previous.is_some() {
            self.detach_socket_internal(socket_id, false).await;
        }
        if workspace_switch {
            if let Some(previous) = &previous {
                self.inner
                    .transport
                    .leave_room(socket_id, &workspace_room(&previous.workspace_id))
                    .await;
            }
            let mut state = self.inner.state.write().await;
            state
                .socket_session_history
                .insert(socket_id.to_string(), HashSet::new());
        }
        self.inner
            .transport
            .join_room(socket_id, &workspace_room(workspace_id))
            .await;

        self.join_session(socket_id, workspace_id, session_id, false)
            .await
    }

    /// Write client input to the session's PTY. Lines ending in CR/LF
    /// are recorded as the last command and, when they look like a
    /// long-running dev command, handed to the supervisor.
    pub async fn write_to_pty(
        &self,
        socket_id: &str,
        data: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let (workspace_id, session_id) =
            self.resolve_socket_session(socket_id, session_id).await?;

        let (writer_tx, workspace_path) = {
            let state = self.inner.state.read().await;
            let runtime = runtime_of(&state, &workspace_id, &session_id)?;
            (
                runtime.writer_tx.clone(),
                runtime.workspace.local_path.clone(),
            )
        };
        writer_tx
            .send(Bytes::from(data.as_bytes().to_vec()))
            .map_err(|_| TermspaceError::Pty("PTY writer closed".to_string()))?;

        if data.contains('\r') || data.contains('\n') {
            if let Some(line) = extract_command_line(data) {
                if let Err(e) = self
                    .inner
                    .sessions
                    .update_session_state(
                        &session_id,
                        &[SessionPatch::LastCommand(line.clone())],
                    )
                    .await
                {
                    debug!("Command bookkeeping failed for {}: {}", session_id, e);
                }

                if should_track_command(&line) {
                    let parsed = parse_command(&line);
                    let options = TrackOptions {
                        cwd: Some(workspace_path),
                        auto_restart: is_development_server(&line),
                        session_id: Some(session_id.clone()),
                        workspace_id: Some(workspace_id.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = self
                        .inner
                        .supervisor
                        .track_process(&parsed.command, &parsed.args, options)
                        .await
                    {
                        warn!("Failed to supervise command '{}': {}", line, e);
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn resize_pty(
        &self,
        socket_id: &str,
        cols: u16,
        rows: u16,
        session_id: Option<&str>,
    ) -> Result<()> {
        let (workspace_id, session_id) =
            self.resolve_socket_session(socket_id, session_id).await?;

        {
            let state = self.inner.state.read().await;
            let runtime = runtime_of(&state, &workspace_id, &session_id)?;
            runtime
                .resize_tx
                .send((cols, rows))
                .map_err(|_| TermspaceError::Pty("PTY resize channel closed".to_string()))?;
        }

        if let Err(e) = self
            .inner
            .sessions
            .update_session_state(
                &session_id,
                &[SessionPatch::TerminalSize(TerminalSize { cols, rows })],
            )
            .await
        {
            debug!("Resize bookkeeping failed for {}: {}", session_id, e);
        }
        Ok(())
    }

    /// Drop a socket. The PTY stays alive; the session pauses when its
    /// last socket goes away.
    pub async fn handle_socket_disconnect(&self, socket_id: &str) {
        self.detach_socket_internal(socket_id, true).await;
    }

    /// Kill a session's PTY and terminate it.
    pub async fn close_session(&self, workspace_id: &str, session_id: &str) -> Result<()> {
        let runtime = {
            let mut state = self.inner.state.write().await;
            let ws = state
                .workspace_sessions
                .get_mut(workspace_id)
                .ok_or_else(|| TermspaceError::SessionNotFound(session_id.to_string()))?;
            let runtime = ws
                .remove_session(session_id)
                .ok_or_else(|| TermspaceError::SessionNotFound(session_id.to_string()))?;
            for socket in &runtime.sockets {
                state.socket_to_session.remove(socket);
            }
            runtime
        };

        if pid_alive(runtime.shell_pid) {
            if let Err(e) = runtime.killer.lock().unwrap().kill() {
                debug!("PTY kill for session {} reported: {}", session_id, e);
            }
        }

        if let Err(e) = self
            .inner
            .sessions
            .terminate_session(session_id, TerminationReason::ManualClose)
            .await
        {
            warn!("Terminating closed session {} failed: {}", session_id, e);
        }
        self.remove_from_layout(workspace_id, session_id).await;

        self.inner
            .transport
            .emit_to_room(
                &workspace_room(workspace_id),
                ServerEvent::TerminalKilled {
                    workspace_id: workspace_id.to_string(),
                    session_id: session_id.to_string(),
                },
            )
            .await;
        info!("Closed session {} in workspace {}", session_id, workspace_id);
        Ok(())
    }

    /// The socket's current attachment, for `get-terminal-info`.
    pub async fn get_socket_attachment(&self, socket_id: &str) -> Option<(String, String)> {
        let state = self.inner.state.read().await;
        state
            .socket_to_session
            .get(socket_id)
            .map(|a| (a.workspace_id.clone(), a.session_id.clone()))
    }

    /// Kill every PTY, terminate every session, drop all state.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweep_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.lifecycle_handle.lock().await.take() {
            handle.abort();
        }

        let workspaces: Vec<(String, Vec<String>)> = {
            let state = self.inner.state.read().await;
            state
                .workspace_sessions
                .iter()
                .map(|(id, ws)| (id.clone(), ws.session_order.clone()))
                .collect()
        };
        for (workspace_id, session_ids) in workspaces {
            for session_id in session_ids {
                let runtime = {
                    let mut state = self.inner.state.write().await;
                    state
                        .workspace_sessions
                        .get_mut(&workspace_id)
                        .and_then(|ws| ws.remove_session(&session_id))
                };
                if let Some(runtime) = runtime {
                    let _ = runtime.killer.lock().unwrap().kill();
                }
                if let Err(e) = self
                    .inner
                    .sessions
                    .terminate_session(&session_id, TerminationReason::Shutdown)
                    .await
                {
                    debug!("Shutdown termination of {} failed: {}", session_id, e);
                }
            }
        }

        let mut state = self.inner.state.write().await;
        state.workspace_sessions.clear();
        state.socket_to_session.clear();
        state.socket_session_history.clear();
        info!("PTY multiplexer shut down");
    }

    // ---- internals ----

    /// Add the socket to a live runtime, deciding replay, and announce
    /// the resume.
    async fn join_session(
        &self,
        socket_id: &str,
        workspace_id: &str,
        session_id: &str,
        force_replay: bool,
    ) -> Result<()> {
        let (history, session_name, recovery_token, replay) = {
            let mut state = self.inner.state.write().await;
            let first_visit_in_workspace = state
                .socket_session_history
                .get(socket_id)
                .map(|visited| visited.is_empty())
                .unwrap_or(true);

            let ws = state
                .workspace_sessions
                .get_mut(workspace_id)
                .ok_or_else(|| TermspaceError::SessionNotFound(session_id.to_string()))?;
            let runtime = ws
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| TermspaceError::SessionNotFound(session_id.to_string()))?;

            runtime.sockets.insert(socket_id.to_string());
            let replay = force_replay || first_visit_in_workspace;

            let history = Arc::clone(&runtime.history);
            let name = runtime.session_name.clone();
            let token = runtime.recovery_token.clone();

            state
                .socket_to_session
                .insert(socket_id.to_string(), SocketAttachment {
                    workspace_id: workspace_id.to_string(),
                    session_id: session_id.to_string(),
                });
            state
                .socket_session_history
                .entry(socket_id.to_string())
                .or_default()
                .insert(session_id.to_string());

            (history, name, token, replay)
        };

        self.inner
            .sessions
            .attach_socket_to_session(session_id, socket_id)
            .await?;

        if replay {
            self.replay_history(socket_id, session_id, &history).await;
        }
        self.inner
            .transport
            .emit(
                socket_id,
                ServerEvent::TerminalResumed {
                    workspace_id: workspace_id.to_string(),
                    session_id: session_id.to_string(),
                    session_name,
                    recovery_token,
                },
            )
            .await;
        Ok(())
    }

    /// Spawn a fresh PTY for a persisted session row and announce the
    /// recovery. Only scrollback and metadata survive; the shell's
    /// in-process state does not.
    async fn recover_session(
        &self,
        socket_id: &str,
        workspace: &Workspace,
        row: termspace_core::SessionRecord,
    ) -> Result<String> {
        let size = row
            .terminal_size
            .as_deref()
            .and_then(|blob| TerminalSize::decode(blob).ok())
            .unwrap_or_default();
        let pty = spawn_pty(workspace, size)?;
        let history = Arc::new(
            SessionHistory::open(&self.inner.history_dir, &workspace.id, &row.id).await?,
        );

        if let Some(pid) = pty.shell_pid {
            self.inner.sessions.record_shell_pid(&row.id, pid).await?;
        }

        self.register_runtime(
            workspace,
            &row.id,
            &row.session_name,
            &row.recovery_token,
            row.is_default_session,
            history,
            pty.writer_tx,
            pty.resize_tx,
            pty.killer,
            pty.shell_pid,
        )
        .await;
        self.spawn_session_pump(
            workspace.id.clone(),
            row.id.clone(),
            pty.master,
            pty.child,
            pty.output_rx,
            pty.resize_loop_rx,
        );

        self.inner
            .transport
            .emit(
                socket_id,
                ServerEvent::TerminalRecovered {
                    workspace_id: workspace.id.clone(),
                    session_id: row.id.clone(),
                    session_name: row.session_name.clone(),
                    recovery_token: row.recovery_token.clone(),
                    recovered_state: RecoveredState {
                        current_dir: row.current_working_dir.clone(),
                        env_vars: row.environment_vars.clone(),
                        terminal_size: row.terminal_size.clone(),
                    },
                },
            )
            .await;

        self.join_session(socket_id, &workspace.id, &row.id, false)
            .await?;
        info!("Recovered session {} (workspace: {})", row.id, workspace.id);
        Ok(row.id)
    }

    /// Spawn a PTY and create a brand new session around it.
    async fn create_session_runtime(
        &self,
        socket_id: &str,
        workspace: &Workspace,
        requested_id: Option<&str>,
    ) -> Result<String> {
        let size = TerminalSize::default();
        let pty = spawn_pty(workspace, size)?;

        let (is_default, session_name, layout_id) = {
            let state = self.inner.state.read().await;
            let ws = state.workspace_sessions.get(&workspace.id);
            let count = ws.map(|w| w.session_order.len()).unwrap_or(0);
            let has_default = ws.and_then(|w| w.default_session_id.clone()).is_some();
            (
                !has_default,
                format!("Terminal {}", count + 1),
                ws.and_then(|w| w.layout_id.clone()),
            )
        };

        let record = self
            .inner
            .sessions
            .create_session(
                &workspace.id,
                pty.shell_pid,
                CreateSessionOptions {
                    session_id: requested_id.map(str::to_string),
                    socket_id: Some(socket_id.to_string()),
                    terminal_size: size,
                    session_name: session_name.clone(),
                    is_default,
                    ..Default::default()
                },
            )
            .await?;

        // Block until the on-disk restore completes so a replay right
        // after creation already includes prior-run scrollback.
        let history = Arc::new(
            SessionHistory::open(&self.inner.history_dir, &workspace.id, &record.id).await?,
        );

        self.register_runtime(
            workspace,
            &record.id,
            &session_name,
            &record.recovery_token,
            is_default,
            history,
            pty.writer_tx,
            pty.resize_tx,
            pty.killer,
            pty.shell_pid,
        )
        .await;
        self.spawn_session_pump(
            workspace.id.clone(),
            record.id.clone(),
            pty.master,
            pty.child,
            pty.output_rx,
            pty.resize_loop_rx,
        );

        if let Some(layout_id) = layout_id {
            if let Err(e) = self
                .inner
                .layouts
                .add_session_to_layout(&layout_id, &record.id)
                .await
            {
                warn!("Failed to add session {} to layout: {}", record.id, e);
            }
        }

        self.inner
            .transport
            .emit(
                socket_id,
                ServerEvent::TerminalCreated {
                    workspace_id: workspace.id.clone(),
                    session_id: record.id.clone(),
                    session_name: session_name.clone(),
                    recovery_token: record.recovery_token.clone(),
                },
            )
            .await;

        self.join_session(socket_id, &workspace.id, &record.id, false)
            .await?;
        info!(
            "Created session {} (workspace: {}, pid: {:?})",
            record.id, workspace.id, pty.shell_pid
        );
        Ok(record.id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn register_runtime(
        &self,
        workspace: &Workspace,
        session_id: &str,
        session_name: &str,
        recovery_token: &str,
        is_default: bool,
        history: Arc<SessionHistory>,
        writer_tx: mpsc::UnboundedSender<Bytes>,
        resize_tx: mpsc::UnboundedSender<(u16, u16)>,
        killer: Box<dyn ChildKiller + Send + Sync>,
        shell_pid: Option<u32>,
    ) {
        let mut state = self.inner.state.write().await;
        let ws = state
            .workspace_sessions
            .entry(workspace.id.clone())
            .or_insert_with(WorkspaceSessions::new);

        ws.sessions.insert(
            session_id.to_string(),
            SessionRuntime {
                session_id: session_id.to_string(),
                workspace: workspace.clone(),
                session_name: session_name.to_string(),
                recovery_token: recovery_token.to_string(),
                sockets: HashSet::new(),
                history,
                writer_tx,
                resize_tx,
                killer: StdMutex::new(killer),
                shell_pid,
                state_sync: StdMutex::new(Instant::now()),
            },
        );
        ws.session_order.push(session_id.to_string());
        if is_default || ws.default_session_id.is_none() {
            ws.default_session_id = Some(session_id.to_string());
        }
    }

    fn spawn_session_pump(
        &self,
        workspace_id: String,
        session_id: String,
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn portable_pty::Child + Send + Sync>,
        mut output_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
    ) {
        let mux = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = output_rx.recv() => match chunk {
                        Some(chunk) => mux.on_pty_output(&workspace_id, &session_id, chunk).await,
                        None => break,
                    },
                    Some((cols, rows)) = resize_rx.recv() => {
                        if let Err(e) = master.resize(PtySize {
                            cols,
                            rows,
                            pixel_width: 0,
                            pixel_height: 0,
                        }) {
                            warn!("Resize of session {} failed: {}", session_id, e);
                        }
                    }
                }
            }

            let exit_code = tokio::task::spawn_blocking(move || {
                let mut child = child;
                child.wait().ok().map(|status| status.exit_code())
            })
            .await
            .ok()
            .flatten();
            drop(master);
            debug!("Session {} PTY exited with code {:?}", session_id, exit_code);
            mux.on_pty_exit(&workspace_id, &session_id).await;
        });
    }

    async fn on_pty_output(&self, workspace_id: &str, session_id: &str, chunk: Bytes) {
        let (history, due_for_sync) = {
            let state = self.inner.state.read().await;
            let Some(runtime) = state
                .workspace_sessions
                .get(workspace_id)
                .and_then(|ws| ws.sessions.get(session_id))
            else {
                return;
            };
            let due = {
                let mut last = runtime.state_sync.lock().unwrap();
                if last.elapsed() >= STATE_SYNC_FLOOR {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            (Arc::clone(&runtime.history), due)
        };

        history.write(chunk.clone()).await;

        let text = String::from_utf8_lossy(&chunk).to_string();
        self.inner
            .transport
            .emit_to_room(
                &workspace_room(workspace_id),
                ServerEvent::TerminalOutput {
                    session_id: session_id.to_string(),
                    data: text.clone(),
                },
            )
            .await;

        if due_for_sync {
            if let Some(tail) = extract_output_tail(&text) {
                if let Err(e) = self
                    .inner
                    .sessions
                    .update_session_state(session_id, &[SessionPatch::LastCommand(tail)])
                    .await
                {
                    debug!("Output bookkeeping failed for {}: {}", session_id, e);
                }
            }
        }
    }

    async fn on_pty_exit(&self, workspace_id: &str, session_id: &str) {
        let removed = {
            let mut state = self.inner.state.write().await;
            let removed = state
                .workspace_sessions
                .get_mut(workspace_id)
                .and_then(|ws| ws.remove_session(session_id));
            if let Some(runtime) = &removed {
                for socket in &runtime.sockets {
                    state.socket_to_session.remove(socket);
                }
            }
            removed
        };
        // Already closed deliberately; nothing left to announce.
        let Some(_runtime) = removed else {
            return;
        };

        let room = workspace_room(workspace_id);
        self.inner
            .transport
            .emit_to_room(
                &room,
                ServerEvent::TerminalOutput {
                    session_id: session_id.to_string(),
                    data: "\r\nShell exited.\r\n".to_string(),
                },
            )
            .await;
        self.inner
            .transport
            .emit_to_room(
                &room,
                ServerEvent::TerminalKilled {
                    workspace_id: workspace_id.to_string(),
                    session_id: session_id.to_string(),
                },
            )
            .await;

        if let Err(e) = self
            .inner
            .sessions
            .terminate_session(session_id, TerminationReason::ProcessExit)
            .await
        {
            debug!("Exit termination of {} failed: {}", session_id, e);
        }
        self.remove_from_layout(workspace_id, session_id).await;
    }

    /// The session manager terminated a session (idle timeout, stale
    /// sweep). Release its runtime if we still hold one.
    async fn handle_session_terminated(&self, event: SessionLifecycleEvent) {
        let removed = {
            let mut state = self.inner.state.write().await;
            let removed = state
                .workspace_sessions
                .get_mut(&event.workspace_id)
                .and_then(|ws| ws.remove_session(&event.session_id));
            if let Some(runtime) = &removed {
                for socket in &runtime.sockets {
                    state.socket_to_session.remove(socket);
                }
            }
            removed
        };
        let Some(runtime) = removed else {
            return;
        };

        info!(
            "Releasing runtime of session {} ({})",
            event.session_id,
            event.reason.as_str()
        );
        let _ = runtime.killer.lock().unwrap().kill();
        self.remove_from_layout(&event.workspace_id, &event.session_id)
            .await;
        self.inner
            .transport
            .emit_to_room(
                &workspace_room(&event.workspace_id),
                ServerEvent::TerminalKilled {
                    workspace_id: event.workspace_id.clone(),
                    session_id: event.session_id.clone(),
                },
            )
            .await;
    }

    /// Close every session whose shell PID the OS no longer reports.
    async fn sweep_dead_sessions(&self) {
        let candidates: Vec<(String, String)> = {
            let state = self.inner.state.read().await;
            state
                .workspace_sessions
                .iter()
                .flat_map(|(workspace_id, ws)| {
                    ws.sessions
                        .values()
                        .filter(|runtime| !pid_alive(runtime.shell_pid))
                        .map(|runtime| (workspace_id.clone(), runtime.session_id.clone()))
                })
                .collect()
        };
        for (workspace_id, session_id) in candidates {
            info!("Sweeping dead session {} in {}", session_id, workspace_id);
            if let Err(e) = self.close_session(&workspace_id, &session_id).await {
                warn!("Sweep of session {} failed: {}", session_id, e);
            }
        }
    }

    /// Remove a socket from its session. Pausing the session is decided
    /// under the same lock that mutates the socket set.
    async fn detach_socket_internal(&self, socket_id: &str, forget_history: bool) {
        let detached = {
            let mut state = self.inner.state.write().await;
            let attachment = state.socket_to_session.remove(socket_id);
            if forget_history {
                state.socket_session_history.remove(socket_id);
            }
            match attachment {
                Some(attachment) => {
                    let now_empty = state
                        .workspace_sessions
                        .get_mut(&attachment.workspace_id)
                        .and_then(|ws| ws.sessions.get_mut(&attachment.session_id))
                        .map(|runtime| {
                            runtime.sockets.remove(socket_id);
                            runtime.sockets.is_empty()
                        });
                    Some((attachment, now_empty))
                }
                None => None,
            }
        };

        let Some((attachment, now_empty)) = detached else {
            return;
        };
        if forget_history {
            self.inner
                .transport
                .leave_room(socket_id, &workspace_room(&attachment.workspace_id))
                .await;
        }
        if now_empty == Some(true) {
            if let Err(e) = self
                .inner
                .sessions
                .detach_socket_from_session(&attachment.session_id)
                .await
            {
                warn!(
                    "Pausing session {} after disconnect failed: {}",
                    attachment.session_id, e
                );
            }
        }
    }

    /// Emit the framed scrollback to a single socket. Empty history is
    /// silent.
    async fn replay_history(
        &self,
        socket_id: &str,
        session_id: &str,
        history: &Arc<SessionHistory>,
    ) {
        let chunks = history.get_recent().await;
        if chunks.is_empty() {
            return;
        }
        let mut body = Vec::new();
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }

        for data in [
            REPLAY_BANNER.to_string(),
            String::from_utf8_lossy(&body).to_string(),
            REPLAY_FOOTER.to_string(),
        ] {
            self.inner
                .transport
                .emit(
                    socket_id,
                    ServerEvent::TerminalOutput {
                        session_id: session_id.to_string(),
                        data,
                    },
                )
                .await;
        }
    }

    async fn remove_from_layout(&self, workspace_id: &str, session_id: &str) {
        let layout_id = {
            let state = self.inner.state.read().await;
            state
                .workspace_sessions
                .get(workspace_id)
                .and_then(|ws| ws.layout_id.clone())
        };
        if let Some(layout_id) = layout_id {
            if let Err(e) = self
                .inner
                .layouts
                .remove_session_from_layout(&layout_id, session_id)
                .await
            {
                warn!(
                    "Failed to remove session {} from layout {}: {}",
                    session_id, layout_id, e
                );
            }
        }
    }

    async fn resolve_socket_session(
        &self,
        socket_id: &str,
        session_override: Option<&str>,
    ) -> Result<(String, String)> {
        let state = self.inner.state.read().await;
        let attachment = state
            .socket_to_session
            .get(socket_id)
            .ok_or_else(|| {
                TermspaceError::SessionNotFound(format!("socket {socket_id} is not attached"))
            })?;
        let session_id = session_override
            .unwrap_or(&attachment.session_id)
            .to_string();
        runtime_of(&state, &attachment.workspace_id, &session_id)?;
        Ok((attachment.workspace_id.clone(), session_id))
    }
}

fn runtime_of<'a>(
    state: &'a MuxState,
    workspace_id: &str,
    session_id: &str,
) -> Result<&'a SessionRuntime> {
    state
        .workspace_sessions
        .get(workspace_id)
        .and_then(|ws| ws.sessions.get(session_id))
        .ok_or_else(|| TermspaceError::SessionNotFound(session_id.to_string()))
}

struct SpawnedPty {
    shell_pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    resize_tx: mpsc::UnboundedSender<(u16, u16)>,
    output_rx: mpsc::Receiver<Bytes>,
    resize_loop_rx: mpsc::UnboundedReceiver<(u16, u16)>,
}

/// Spawn the workspace shell on a fresh PTY: `bash --login` (or
/// `powershell.exe` on Windows), 80x30, cwd at the workspace root, with
/// the standard terminal environment layered over the server's.
fn spawn_pty(workspace: &Workspace, size: TerminalSize) -> Result<SpawnedPty> {
    let pty_system = NativePtySystem::default();
    let pair = pty_system
        .openpty(PtySize {
            cols: size.cols,
            rows: size.rows,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TermspaceError::Pty(format!("openpty failed: {e}")))?;

    let mut cmd = if cfg!(windows) {
        CommandBuilder::new("powershell.exe")
    } else {
        let mut cmd = CommandBuilder::new("bash");
        cmd.arg("--login");
        cmd
    };
    cmd.cwd(&workspace.local_path);
    cmd.env("TERM", "xterm-256color");
    cmd.env("HOME", "/home/claude");
    cmd.env("USER", "claude");
    cmd.env("SHELL", "/bin/bash");
    let path = std::env::var("PATH").unwrap_or_default();
    cmd.env("PATH", format!("{path}:/home/claude/.local/bin"));
    cmd.env(
        "PS1",
        "\\[\\e[1;36m\\]\\u\\[\\e[0m\\]:\\[\\e[1;34m\\]\\w\\[\\e[0m\\]\\$ ",
    );

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| TermspaceError::Pty(format!("spawn shell failed: {e}")))?;
    let shell_pid = child.process_id();
    let killer = child.clone_killer();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TermspaceError::Pty(format!("PTY reader unavailable: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| TermspaceError::Pty(format!("PTY writer unavailable: {e}")))?;

    // Reader thread: blocking PTY reads feeding the async pump.
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(1024);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Writer task: serialized input in arrival order.
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        while let Some(data) = writer_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    let (resize_tx, resize_loop_rx) = mpsc::unbounded_channel::<(u16, u16)>();

    Ok(SpawnedPty {
        shell_pid,
        master: pair.master,
        child,
        killer,
        writer_tx,
        resize_tx,
        output_rx,
        resize_loop_rx,
    })
}

/// The input line a CR/LF-bearing chunk carries, if any.
fn extract_command_line(data: &str) -> Option<String> {
    let line = data.split(['\r', '\n']).next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Last non-empty line of an output chunk, bounded for the store.
fn extract_output_tail(text: &str) -> Option<String> {
    let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::{MemoryStore, SessionStore};
    use crate::supervisor::TokioSpawner;
    use crate::transport::InMemoryTransport;
    use crate::workspace::ConfigWorkspaceService;
    use termspace_core::SessionStatus;

    struct Fixture {
        mux: PtyMultiplexer,
        transport: Arc<InMemoryTransport>,
        store: Arc<MemoryStore>,
        _dirs: Vec<tempfile::TempDir>,
    }

    async fn fixture(workspace_ids: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock);
        let transport = Arc::new(InMemoryTransport::new());
        let history_dir = tempfile::tempdir().unwrap();

        let mut dirs = vec![history_dir];
        let workspaces: Vec<Workspace> = workspace_ids
            .iter()
            .map(|id| {
                let dir = tempfile::tempdir().unwrap();
                let workspace = Workspace {
                    id: id.to_string(),
                    name: id.to_string(),
                    local_path: dir.path().to_path_buf(),
                };
                dirs.push(dir);
                workspace
            })
            .collect();

        let sessions = SessionManager::new(
            store.clone() as Arc<dyn SessionStore>,
            clock.clone() as Arc<dyn crate::clock::Clock>,
        )
        .await;
        let layouts = Arc::new(LayoutEngine::new(
            store.clone() as Arc<dyn SessionStore>,
            clock.clone() as Arc<dyn crate::clock::Clock>,
        ));
        let supervisor = ProcessSupervisor::new(
            store.clone() as Arc<dyn SessionStore>,
            Arc::new(TokioSpawner),
            clock.clone() as Arc<dyn crate::clock::Clock>,
        );
        let mux = PtyMultiplexer::new(
            sessions,
            layouts,
            supervisor,
            Arc::new(ConfigWorkspaceService::from_workspaces(workspaces)),
            transport.clone() as Arc<dyn ClientTransport>,
            dirs[0].path().to_path_buf(),
        );

        Fixture {
            mux,
            transport,
            store,
            _dirs: dirs,
        }
    }

    fn replay_banners(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(e, ServerEvent::TerminalOutput { data, .. } if data.contains("session history"))
            })
            .count()
    }

    async fn wait_for_history(fx: &Fixture, workspace_id: &str, session_id: &str) {
        for _ in 0..200 {
            let non_empty = {
                let state = fx.mux.inner.state.read().await;
                state
                    .workspace_sessions
                    .get(workspace_id)
                    .and_then(|ws| ws.sessions.get(session_id))
                    .map(|r| Arc::clone(&r.history))
            };
            if let Some(history) = non_empty {
                if !history.is_empty().await {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session {session_id} never produced output");
    }

    #[tokio::test]
    async fn test_create_then_resume_and_socket_exclusivity() {
        let fx = fixture(&["w1"]).await;

        let created = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        assert_eq!(created.kind, AttachKind::Created);

        // The default session resumes for a second socket.
        let resumed = fx
            .mux
            .create_pty_for_socket("s2", Some("w1"), None, None)
            .await
            .unwrap();
        assert_eq!(resumed.kind, AttachKind::Resumed);
        assert_eq!(resumed.session_id, created.session_id);

        // One attachment per socket.
        assert_eq!(
            fx.mux.get_socket_attachment("s1").await,
            Some(("w1".to_string(), created.session_id.clone()))
        );

        let events = fx.transport.events_for("s1");
        assert!(matches!(events[0], ServerEvent::TerminalCreated { .. }));

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_tab_switch_suppresses_replay() {
        let fx = fixture(&["w1"]).await;

        let a = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        // A second, explicitly named session in the same workspace.
        let b = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), Some("sess-b"), None)
            .await
            .unwrap();
        assert_eq!(b.kind, AttachKind::Created);

        wait_for_history(&fx, "w1", &a.session_id).await;
        fx.transport.clear_events("s1");

        // Tab switches after the first visit stay silent.
        fx.mux
            .switch_socket_to_session("s1", "w1", &a.session_id)
            .await
            .unwrap();
        fx.mux
            .switch_socket_to_session("s1", "w1", "sess-b")
            .await
            .unwrap();
        assert_eq!(replay_banners(&fx.transport.events_for("s1")), 0);

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_workspace_switch_restores_replay() {
        let fx = fixture(&["w1", "w2"]).await;

        let a = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        wait_for_history(&fx, "w1", &a.session_id).await;

        // Leave for another workspace, then come back: the first visit
        // after the switch replays accumulated scrollback.
        fx.mux
            .create_pty_for_socket("s1", Some("w2"), None, None)
            .await
            .unwrap();
        fx.transport.clear_events("s1");
        let back = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        assert_eq!(back.kind, AttachKind::Resumed);
        assert_eq!(back.session_id, a.session_id);
        assert_eq!(replay_banners(&fx.transport.events_for("s1")), 1);

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_keeps_pty_alive_and_pauses() {
        let fx = fixture(&["w1"]).await;

        let created = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        fx.mux.handle_socket_disconnect("s1").await;

        let session = fx
            .store
            .get_session(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.socket_id, None);

        // The runtime and its shell are still there.
        {
            let state = fx.mux.inner.state.read().await;
            let runtime = state
                .workspace_sessions
                .get("w1")
                .and_then(|ws| ws.sessions.get(&created.session_id))
                .expect("runtime must survive disconnect");
            assert!(pid_alive(runtime.shell_pid));
        }
        assert_eq!(fx.mux.get_socket_attachment("s1").await, None);

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_with_remaining_socket_stays_active() {
        let fx = fixture(&["w1"]).await;

        let created = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        fx.mux
            .create_pty_for_socket("s2", Some("w1"), None, None)
            .await
            .unwrap();

        fx.mux.handle_socket_disconnect("s1").await;
        let session = fx
            .store
            .get_session(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_session_terminates_and_promotes_default() {
        let fx = fixture(&["w1"]).await;

        let a = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        fx.mux
            .create_pty_for_socket("s1", Some("w1"), Some("sess-b"), None)
            .await
            .unwrap();

        fx.mux.close_session("w1", &a.session_id).await.unwrap();

        let session = fx
            .store
            .get_session(&a.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);

        {
            let state = fx.mux.inner.state.read().await;
            let ws = state.workspace_sessions.get("w1").unwrap();
            assert!(!ws.sessions.contains_key(&a.session_id));
            assert_eq!(ws.default_session_id.as_deref(), Some("sess-b"));
        }

        // Closing again reports not-found.
        let err = fx.mux.close_session("w1", &a.session_id).await.unwrap_err();
        assert!(matches!(err, TermspaceError::SessionNotFound(_)));

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_error() {
        let fx = fixture(&["w1"]).await;
        let err = fx
            .mux
            .create_pty_for_socket("s1", Some("nope"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TermspaceError::WorkspaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_write_records_last_command() {
        let fx = fixture(&["w1"]).await;

        let created = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();
        fx.mux
            .write_to_pty("s1", "echo hello\n", None)
            .await
            .unwrap();

        let session = fx
            .store
            .get_session(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session
            .shell_history
            .iter()
            .any(|entry| entry.command == "echo hello"));

        fx.mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let fx = fixture(&["w1"]).await;
        let created = fx
            .mux
            .create_pty_for_socket("s1", Some("w1"), None, None)
            .await
            .unwrap();

        fx.mux.shutdown().await;

        let session = fx
            .store
            .get_session(&created.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
        assert_eq!(fx.mux.get_socket_attachment("s1").await, None);
    }

    #[test]
    fn test_extract_command_line() {
        assert_eq!(extract_command_line("ls -la\n"), Some("ls -la".to_string()));
        assert_eq!(extract_command_line("ls\rmore"), Some("ls".to_string()));
        assert_eq!(extract_command_line("\r\n"), None);
        assert_eq!(extract_command_line("   \n"), None);
    }

    #[test]
    fn test_extract_output_tail() {
        assert_eq!(
            extract_output_tail("line one\nline two\n\n"),
            Some("line two".to_string())
        );
        assert_eq!(extract_output_tail("\n \n"), None);
        let long = "x".repeat(500);
        assert_eq!(extract_output_tail(&long).unwrap().len(), 200);
    }
}
