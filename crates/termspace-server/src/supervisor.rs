//! Process supervisor
//!
//! Tracks long-running user commands (dev servers, watchers)
//! independently of the PTY sessions they were typed into. Children are
//! spawned attached with piped stdio; a watcher task per child records
//! the exit, and a 10-second monitor loop probes PIDs for rows whose
//! handle we do not own (restored after a restart).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use termspace_core::{ProcessStatus, Result, TermspaceError, UserProcessRecord};

use crate::clock::Clock;
use crate::storage::SessionStore;

/// Health-probe cadence for running rows.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL in `stop_process`.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Dead rows older than this are deleted by the monitor loop.
const DEAD_ROW_RETENTION_HOURS: i64 = 24;

/// Is this PID alive according to the OS? Windows shells are spawned
/// like any other, but liveness probing is unix-only.
pub(crate) fn pid_alive(pid: Option<u32>) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Spawning capability so tests can script children.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<SpawnedProcess>;

    fn pid_alive(&self, pid: Option<u32>) -> bool;
}

pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Box<dyn ManagedChild + Send>,
    pub signaller: Arc<dyn ProcessSignaller>,
}

/// The wait side of a spawned child; owned by its watcher task.
#[async_trait]
pub trait ManagedChild: Send {
    async fn wait(&mut self) -> Result<Option<i32>>;
}

/// The signal side, shared so stop/restart can reach a child whose
/// watcher currently awaits it.
pub trait ProcessSignaller: Send + Sync {
    fn terminate(&self);
    fn kill(&self);
}

/// Production spawner over `tokio::process`.
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<SpawnedProcess> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env);
        }

        let child = cmd
            .spawn()
            .map_err(|e| TermspaceError::Process(format!("spawn {command} failed: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| TermspaceError::Process(format!("spawn {command} yielded no pid")))?;

        Ok(SpawnedProcess {
            pid,
            child: Box::new(TokioChild { child }),
            signaller: Arc::new(PidSignaller { pid }),
        })
    }

    fn pid_alive(&self, pid: Option<u32>) -> bool {
        pid_alive(pid)
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ManagedChild for TokioChild {
    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TermspaceError::Process(format!("wait failed: {e}")))?;
        Ok(status.code())
    }
}

struct PidSignaller {
    pid: u32,
}

impl ProcessSignaller for PidSignaller {
    fn terminate(&self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        debug!("terminate signal unsupported on this platform for pid {}", self.pid);
    }

    fn kill(&self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        debug!("kill signal unsupported on this platform for pid {}", self.pid);
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub cwd: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
    pub auto_restart: bool,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub restart_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub monitoring: bool,
    pub tracked: usize,
}

struct TrackedEntry {
    record_id: String,
    signaller: Arc<dyn ProcessSignaller>,
    #[allow(dead_code)]
    started: Instant,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    store: Arc<dyn SessionStore>,
    spawner: Arc<dyn ProcessSpawner>,
    clock: Arc<dyn Clock>,
    /// pid -> live child bookkeeping for children of this run.
    processes: Arc<DashMap<u32, TrackedEntry>>,
    /// Record ids being stopped/restarted on purpose; their watcher must
    /// not write a final status or trigger a restart.
    stopping: Arc<DashMap<String, ()>>,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            spawner,
            clock,
            processes: Arc::new(DashMap::new()),
            stopping: Arc::new(DashMap::new()),
            monitor_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Reconcile persisted running rows against the OS, then begin the
    /// monitor loop.
    pub async fn start(&self) {
        self.restore_processes().await;

        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MONITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                supervisor.check_process_health().await;
                supervisor.cleanup_dead_processes().await;
            }
        });
        *self.monitor_handle.lock().await = Some(handle);
        info!("Process supervisor started");
    }

    /// Spawn and persist a tracked child.
    // Returns a boxed future (rather than `async fn`) to break the
    // recursive opaque-type cycle formed by the spawned watcher task
    // below calling back into `on_child_exit` -> `respawn` ->
    // `track_process` on auto-restart.
    pub fn track_process<'a>(
        &'a self,
        command: &'a str,
        args: &'a [String],
        options: TrackOptions,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<UserProcessRecord>> + Send + 'a>>
    {
        Box::pin(async move {
            let spawned = self
                .spawner
                .spawn(command, args, options.cwd.as_deref(), options.env.as_ref())
                .await?;
            let now = self.clock.now();

            let record = UserProcessRecord {
                id: uuid::Uuid::new_v4().to_string(),
                pid: Some(spawned.pid),
                command: command.to_string(),
                args: args.to_vec(),
                cwd: options
                    .cwd
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                status: ProcessStatus::Running,
                exit_code: None,
                auto_restart: options.auto_restart,
                restart_count: options.restart_count,
                session_id: options.session_id,
                workspace_id: options.workspace_id,
                started_at: now,
                last_seen: now,
                ended_at: None,
            };
            self.store.insert_process(&record).await?;

            self.processes.insert(
                spawned.pid,
                TrackedEntry {
                    record_id: record.id.clone(),
                    signaller: spawned.signaller,
                    started: Instant::now(),
                },
            );

            let supervisor = self.clone();
            let record_id = record.id.clone();
            let pid = spawned.pid;
            let mut child = spawned.child;
            tokio::spawn(async move {
                let exit = child.wait().await;
                supervisor.on_child_exit(&record_id, pid, exit).await;
            });

            info!(
                "Tracking process {} (pid: {}, command: {})",
                record.id, spawned.pid, command
            );
            Ok(record)
        })
    }

    async fn on_child_exit(&self, record_id: &str, pid: u32, exit: Result<Option<i32>>) {
        self.processes.remove(&pid);
        if self.stopping.remove(record_id).is_some() {
            // stop/restart owns the row; nothing to record here.
            return;
        }

        let mut record = match self.store.get_process(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Exit bookkeeping failed for process {}: {}", record_id, e);
                return;
            }
        };
        if record.status != ProcessStatus::Running {
            return;
        }

        match exit {
            Ok(code) => {
                record.status = if code == Some(0) {
                    ProcessStatus::Stopped
                } else {
                    ProcessStatus::Crashed
                };
                record.exit_code = code;
            }
            Err(e) => {
                warn!("Wait failed for process {}: {}", record_id, e);
                record.status = ProcessStatus::Crashed;
            }
        }
        record.ended_at = Some(self.clock.now());

        if let Err(e) = self.store.update_process(&record).await {
            warn!("Failed to persist exit of process {}: {}", record_id, e);
        } else {
            info!(
                "Process {} exited (status: {}, code: {:?})",
                record_id,
                record.status.as_str(),
                record.exit_code
            );
        }

        if record.auto_restart && record.status == ProcessStatus::Crashed {
            if let Err(e) = self.respawn(&record).await {
                error!("Auto-restart of process {} failed: {}", record_id, e);
            }
        }
    }

    /// Gracefully stop a tracked process, escalating to a hard kill
    /// after the grace period, and persist the row as killed.
    pub async fn stop_process(&self, id: &str) -> Result<UserProcessRecord> {
        let Some(mut record) = self.store.get_process(id).await? else {
            return Err(TermspaceError::ProcessNotFound(id.to_string()));
        };

        if let Some(pid) = record.pid {
            if let Some(entry) = self.processes.get(&pid) {
                self.stopping.insert(id.to_string(), ());
                entry.signaller.terminate();
                drop(entry);

                tokio::time::sleep(STOP_GRACE).await;
                if let Some(entry) = self.processes.get(&pid) {
                    warn!("Process {} ignored SIGTERM, killing", id);
                    entry.signaller.kill();
                }
            }
        }

        record.status = ProcessStatus::Killed;
        record.ended_at = Some(self.clock.now());
        self.store.update_process(&record).await?;
        if let Some(pid) = record.pid {
            self.processes.remove(&pid);
        }
        info!("Stopped process {}", id);
        Ok(record)
    }

    /// Stop the running child and start a fresh row with the same
    /// command, arguments, cwd, and ownership.
    pub async fn restart_process(&self, id: &str) -> Result<UserProcessRecord> {
        let Some(mut old) = self.store.get_process(id).await? else {
            return Err(TermspaceError::ProcessNotFound(id.to_string()));
        };

        if let Some(pid) = old.pid {
            if let Some((_, entry)) = self.processes.remove(&pid) {
                self.stopping.insert(old.id.clone(), ());
                entry.signaller.terminate();
            }
        }

        old.status = ProcessStatus::Stopped;
        old.ended_at = Some(self.clock.now());
        self.store.update_process(&old).await?;

        self.respawn(&old).await
    }

    async fn respawn(&self, old: &UserProcessRecord) -> Result<UserProcessRecord> {
        self.track_process(
            &old.command,
            &old.args,
            TrackOptions {
                cwd: old.cwd.as_ref().map(PathBuf::from),
                env: None,
                auto_restart: old.auto_restart,
                session_id: old.session_id.clone(),
                workspace_id: old.workspace_id.clone(),
                restart_count: old.restart_count + 1,
            },
        )
        .await
    }

    /// One monitor pass: crash rows whose PID the OS no longer reports,
    /// heartbeat the rest.
    pub async fn check_process_health(&self) {
        let rows = match self.store.list_running_processes().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Process health query failed: {}", e);
                return;
            }
        };

        for mut row in rows {
            if self.spawner.pid_alive(row.pid) {
                row.last_seen = self.clock.now();
                if let Err(e) = self.store.update_process(&row).await {
                    debug!("Heartbeat update failed for process {}: {}", row.id, e);
                }
            } else {
                row.status = ProcessStatus::Crashed;
                row.ended_at = Some(self.clock.now());
                if let Err(e) = self.store.update_process(&row).await {
                    warn!("Failed to mark process {} crashed: {}", row.id, e);
                } else {
                    info!("Process {} (pid: {:?}) is gone, marked crashed", row.id, row.pid);
                }
                if let Some(pid) = row.pid {
                    self.processes.remove(&pid);
                }
            }
        }
    }

    /// Delete dead rows past retention.
    pub async fn cleanup_dead_processes(&self) {
        let cutoff = self.clock.now() - ChronoDuration::hours(DEAD_ROW_RETENTION_HOURS);
        match self.store.delete_dead_processes(cutoff).await {
            Ok(0) => {}
            Ok(count) => debug!("Deleted {} dead process rows", count),
            Err(e) => warn!("Dead process cleanup failed: {}", e),
        }
    }

    /// Reconcile running rows left by a prior run. A surviving PID keeps
    /// its row but is monitored by probe only; the child handle is not
    /// re-attached. Dead rows are crashed and, if configured, restarted.
    pub async fn restore_processes(&self) {
        let rows = match self.store.list_running_processes().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Process restore query failed: {}", e);
                return;
            }
        };

        for mut row in rows {
            if self.spawner.pid_alive(row.pid) {
                info!(
                    "Process {} (pid: {:?}) survived restart, monitoring by pid",
                    row.id, row.pid
                );
                row.last_seen = self.clock.now();
                let _ = self.store.update_process(&row).await;
                continue;
            }

            row.status = ProcessStatus::Crashed;
            row.ended_at = Some(self.clock.now());
            if let Err(e) = self.store.update_process(&row).await {
                warn!("Failed to mark restored process {} crashed: {}", row.id, e);
                continue;
            }
            if row.auto_restart {
                info!("Restarting process {} after restart", row.id);
                if let Err(e) = self.respawn(&row).await {
                    error!("Restore restart of process {} failed: {}", row.id, e);
                }
            }
        }
    }

    /// Cancel monitoring, mark every running row stopped, drop handles.
    pub async fn stop(&self) {
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }
        match self
            .store
            .mark_all_running_stopped(self.clock.now())
            .await
        {
            Ok(count) if count > 0 => info!("Marked {} running processes stopped", count),
            Ok(_) => {}
            Err(e) => warn!("Failed to mark running processes stopped: {}", e),
        }
        self.processes.clear();
        self.stopping.clear();
    }

    pub async fn get_processes(&self) -> Result<Vec<UserProcessRecord>> {
        self.store.list_processes().await
    }

    pub async fn get_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            monitoring: self.monitor_handle.lock().await.is_some(),
            tracked: self.processes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::{MemoryStore, SessionStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Scripted spawner: children exit when the test (or a signaller)
    /// says so, and PID liveness is a plain set.
    #[derive(Default)]
    struct FakeSpawner {
        next_pid: AtomicU32,
        exits: DashMap<u32, mpsc::UnboundedSender<Option<i32>>>,
        alive: DashMap<u32, ()>,
    }

    impl FakeSpawner {
        fn exit(&self, pid: u32, code: Option<i32>) {
            self.alive.remove(&pid);
            if let Some(tx) = self.exits.get(&pid) {
                let _ = tx.send(code);
            }
        }

        fn mark_dead(&self, pid: u32) {
            self.alive.remove(&pid);
        }
    }

    struct FakeChild {
        rx: mpsc::UnboundedReceiver<Option<i32>>,
    }

    #[async_trait]
    impl ManagedChild for FakeChild {
        async fn wait(&mut self) -> Result<Option<i32>> {
            Ok(self.rx.recv().await.flatten())
        }
    }

    struct FakeSignaller {
        pid: u32,
        tx: mpsc::UnboundedSender<Option<i32>>,
        alive: Arc<FakeSpawner>,
    }

    impl ProcessSignaller for FakeSignaller {
        fn terminate(&self) {
            self.alive.alive.remove(&self.pid);
            let _ = self.tx.send(None);
        }

        fn kill(&self) {
            self.alive.alive.remove(&self.pid);
            let _ = self.tx.send(None);
        }
    }

    #[async_trait]
    impl ProcessSpawner for Arc<FakeSpawner> {
        async fn spawn(
            &self,
            _command: &str,
            _args: &[String],
            _cwd: Option<&Path>,
            _env: Option<&BTreeMap<String, String>>,
        ) -> Result<SpawnedProcess> {
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.exits.insert(pid, tx.clone());
            self.alive.insert(pid, ());
            Ok(SpawnedProcess {
                pid,
                child: Box::new(FakeChild { rx }),
                signaller: Arc::new(FakeSignaller {
                    pid,
                    tx,
                    alive: Arc::clone(self),
                }),
            })
        }

        fn pid_alive(&self, pid: Option<u32>) -> bool {
            pid.map(|p| self.alive.contains_key(&p)).unwrap_or(false)
        }
    }

    fn fixture() -> (ProcessSupervisor, Arc<MemoryStore>, Arc<FakeSpawner>) {
        let store = Arc::new(MemoryStore::new());
        let spawner = Arc::new(FakeSpawner::default());
        let supervisor = ProcessSupervisor::new(
            store.clone() as Arc<dyn SessionStore>,
            Arc::new(spawner.clone()) as Arc<dyn ProcessSpawner>,
            Arc::new(SystemClock),
        );
        (supervisor, store, spawner)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_clean_exit_marks_stopped() {
        let (supervisor, store, spawner) = fixture();
        let record = supervisor
            .track_process("npm", &["test".to_string()], TrackOptions::default())
            .await
            .unwrap();
        assert_eq!(record.status, ProcessStatus::Running);

        spawner.exit(record.pid.unwrap(), Some(0));
        wait_until(|| {
            let store = store.clone();
            let id = record.id.clone();
            async move {
                store
                    .get_process(&id)
                    .await
                    .unwrap()
                    .map(|p| p.status == ProcessStatus::Stopped)
                    .unwrap_or(false)
            }
        })
        .await;

        let row = store.get_process(&record.id).await.unwrap().unwrap();
        assert_eq!(row.exit_code, Some(0));
        assert!(row.ended_at.is_some());
        // Clean exits do not restart.
        assert_eq!(store.list_processes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_with_auto_restart_spawns_replacement() {
        let (supervisor, store, spawner) = fixture();
        let record = supervisor
            .track_process(
                "npm",
                &["run".to_string(), "dev".to_string()],
                TrackOptions {
                    auto_restart: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        spawner.exit(record.pid.unwrap(), Some(1));
        wait_until(|| {
            let store = store.clone();
            async move { store.list_processes().await.unwrap().len() == 2 }
        })
        .await;

        let rows = store.list_processes().await.unwrap();
        let old = rows.iter().find(|r| r.id == record.id).unwrap();
        let new = rows.iter().find(|r| r.id != record.id).unwrap();
        assert_eq!(old.status, ProcessStatus::Crashed);
        assert_eq!(old.exit_code, Some(1));
        assert_eq!(new.status, ProcessStatus::Running);
        assert_eq!(new.restart_count, 1);
        assert_eq!(new.command, "npm");
        assert_eq!(new.args, vec!["run", "dev"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_process_is_killed_without_restart() {
        let (supervisor, store, _spawner) = fixture();
        let record = supervisor
            .track_process(
                "npm",
                &["run".to_string(), "dev".to_string()],
                TrackOptions {
                    auto_restart: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stopped = supervisor.stop_process(&record.id).await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Killed);

        // Give the watcher a chance to misbehave, then check it did not.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let rows = store.list_processes().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn test_stop_unknown_process_fails() {
        let (supervisor, _store, _spawner) = fixture();
        let err = supervisor.stop_process("missing").await.unwrap_err();
        assert!(matches!(err, TermspaceError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_process_bumps_count() {
        let (supervisor, store, _spawner) = fixture();
        let record = supervisor
            .track_process("vite", &[], TrackOptions::default())
            .await
            .unwrap();

        let replacement = supervisor.restart_process(&record.id).await.unwrap();
        assert_eq!(replacement.restart_count, 1);
        assert_eq!(replacement.status, ProcessStatus::Running);

        let old = store.get_process(&record.id).await.unwrap().unwrap();
        assert_eq!(old.status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_health_check_crashes_dead_pids() {
        let (supervisor, store, spawner) = fixture();
        let record = supervisor
            .track_process("serve", &[], TrackOptions::default())
            .await
            .unwrap();

        spawner.mark_dead(record.pid.unwrap());
        supervisor.check_process_health().await;

        let row = store.get_process(&record.id).await.unwrap().unwrap();
        assert_eq!(row.status, ProcessStatus::Crashed);
        assert!(row.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_restore_restarts_configured_rows() {
        let (supervisor, store, _spawner) = fixture();
        let now = chrono::Utc::now();
        // A row from a prior run whose PID no longer exists.
        store
            .insert_process(&UserProcessRecord {
                id: "stale".to_string(),
                pid: Some(77777),
                command: "npm".to_string(),
                args: vec!["run".to_string(), "dev".to_string()],
                cwd: None,
                status: ProcessStatus::Running,
                exit_code: None,
                auto_restart: true,
                restart_count: 2,
                session_id: None,
                workspace_id: None,
                started_at: now,
                last_seen: now,
                ended_at: None,
            })
            .await
            .unwrap();

        supervisor.restore_processes().await;

        let rows = store.list_processes().await.unwrap();
        assert_eq!(rows.len(), 2);
        let old = rows.iter().find(|r| r.id == "stale").unwrap();
        let new = rows.iter().find(|r| r.id != "stale").unwrap();
        assert_eq!(old.status, ProcessStatus::Crashed);
        assert_eq!(new.restart_count, 3);
        assert_eq!(new.status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_marks_running_rows() {
        let (supervisor, store, _spawner) = fixture();
        supervisor
            .track_process("serve", &[], TrackOptions::default())
            .await
            .unwrap();

        supervisor.stop().await;
        let rows = store.list_processes().await.unwrap();
        assert_eq!(rows[0].status, ProcessStatus::Stopped);
        assert_eq!(supervisor.get_status().await.tracked, 0);
    }
}
