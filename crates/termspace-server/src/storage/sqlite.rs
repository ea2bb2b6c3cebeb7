//! SQLite store (embedded, no external dependencies)

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::Arc;
use termspace_core::{
    parse_process_status, parse_session_status, CsrfTokenRecord, LayoutConfig, LayoutRecord,
    LayoutType, RateLimitRecord, Result, SessionRecord, SessionStatus, TermspaceError,
    UserProcessRecord,
};

use super::SessionStore;

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

fn storage_err(e: sqlx::Error) -> TermspaceError {
    TermspaceError::Storage(e.to_string())
}

/// Build a literal `('a','b')` list from the fixed status vocabulary.
fn status_list(statuses: &[SessionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        tracing::info!("Opening SQLite database at: {}", database_path);

        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("Failed to connect to SQLite database at: {}", database_path)
            })?;

        Self::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                recovery_token TEXT UNIQUE NOT NULL,
                session_name TEXT NOT NULL,
                is_default_session INTEGER NOT NULL DEFAULT 0,
                session_type TEXT NOT NULL DEFAULT 'terminal',
                shell_pid INTEGER,
                socket_id TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                current_working_dir TEXT,
                environment_vars TEXT,
                terminal_size TEXT,
                last_command TEXT,
                shell_history TEXT NOT NULL DEFAULT '[]',
                session_timeout INTEGER,
                max_idle_time INTEGER NOT NULL DEFAULT 1440,
                auto_cleanup INTEGER NOT NULL DEFAULT 1,
                can_recover INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL,
                last_activity_at DATETIME NOT NULL,
                ended_at DATETIME
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_workspace
            ON sessions (workspace_id, status)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS layouts (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                layout_type TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                configuration TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_processes (
                id TEXT PRIMARY KEY,
                pid INTEGER,
                command TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                cwd TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                exit_code INTEGER,
                auto_restart INTEGER NOT NULL DEFAULT 0,
                restart_count INTEGER NOT NULL DEFAULT 0,
                session_id TEXT,
                workspace_id TEXT,
                started_at DATETIME NOT NULL,
                last_seen DATETIME NOT NULL,
                ended_at DATETIME
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS csrf_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_ip TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                request_time DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, workspace_id, recovery_token, session_name, is_default_session,
                session_type, shell_pid, socket_id, status, current_working_dir,
                environment_vars, terminal_size, last_command, shell_history,
                session_timeout, max_idle_time, auto_cleanup, can_recover,
                created_at, last_activity_at, ended_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
        )
        .bind(&session.id)
        .bind(&session.workspace_id)
        .bind(&session.recovery_token)
        .bind(&session.session_name)
        .bind(session.is_default_session)
        .bind(&session.session_type)
        .bind(session.shell_pid.map(|p| p as i64))
        .bind(&session.socket_id)
        .bind(session.status.as_str())
        .bind(&session.current_working_dir)
        .bind(&session.environment_vars)
        .bind(&session.terminal_size)
        .bind(&session.last_command)
        .bind(serde_json::to_string(&session.shell_history)?)
        .bind(session.session_timeout)
        .bind(session.max_idle_time)
        .bind(session.auto_cleanup)
        .bind(session.can_recover)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.ended_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("{SELECT_SESSION} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(storage_err)?;

        Ok(row.map(SessionRecord::from))
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                shell_pid = ?1, socket_id = ?2, status = ?3,
                current_working_dir = ?4, environment_vars = ?5,
                terminal_size = ?6, last_command = ?7, shell_history = ?8,
                session_timeout = ?9, max_idle_time = ?10, auto_cleanup = ?11,
                can_recover = ?12, last_activity_at = ?13, ended_at = ?14
            WHERE id = ?15
            "#,
        )
        .bind(session.shell_pid.map(|p| p as i64))
        .bind(&session.socket_id)
        .bind(session.status.as_str())
        .bind(&session.current_working_dir)
        .bind(&session.environment_vars)
        .bind(&session.terminal_size)
        .bind(&session.last_command)
        .bind(serde_json::to_string(&session.shell_history)?)
        .bind(session.session_timeout)
        .bind(session.max_idle_time)
        .bind(session.auto_cleanup)
        .bind(session.can_recover)
        .bind(session.last_activity_at)
        .bind(session.ended_at)
        .bind(&session.id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "{SELECT_SESSION} WHERE status IN ({}) ORDER BY created_at",
            status_list(statuses)
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    async fn find_recoverable_session(
        &self,
        workspace_id: &str,
    ) -> Result<Option<SessionRecord>> {
        let query = format!(
            "{SELECT_SESSION} \
             WHERE workspace_id = ?1 AND can_recover = 1 \
               AND status IN ('active', 'paused') \
             ORDER BY last_activity_at DESC LIMIT 1"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(workspace_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(SessionRecord::from))
    }

    async fn list_cleanup_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "{SELECT_SESSION} \
             WHERE auto_cleanup = 1 AND status IN ('active', 'paused') \
               AND last_activity_at < ?1"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    async fn mark_all_active_terminated(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'terminated', ended_at = ?1, socket_id = NULL, can_recover = 0
            WHERE status = 'active'
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn count_sessions_by_status(&self) -> Result<Vec<(SessionStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sessions GROUP BY status")
                .fetch_all(&*self.pool)
                .await
                .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (parse_session_status(&status), count))
            .collect())
    }

    async fn count_recoverable_sessions(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE can_recover = 1 AND status IN ('active', 'paused')
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(count)
    }

    async fn count_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE status = 'active' AND last_activity_at < ?1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(count)
    }

    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE (status = 'terminated' AND ended_at < ?1)
               OR (status = 'paused' AND last_activity_at < ?1)
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_layout(&self, layout: &LayoutRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO layouts (id, workspace_id, name, layout_type, is_default,
                                 configuration, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&layout.id)
        .bind(&layout.workspace_id)
        .bind(&layout.name)
        .bind(layout.layout_type.as_str())
        .bind(layout.is_default)
        .bind(layout.configuration.encode())
        .bind(layout.created_at)
        .bind(layout.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_layout(&self, id: &str) -> Result<Option<LayoutRecord>> {
        let row: Option<LayoutRow> =
            sqlx::query_as(&format!("{SELECT_LAYOUT} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(storage_err)?;

        row.map(LayoutRecord::try_from).transpose()
    }

    async fn update_layout(&self, layout: &LayoutRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE layouts
            SET name = ?1, layout_type = ?2, is_default = ?3,
                configuration = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(&layout.name)
        .bind(layout.layout_type.as_str())
        .bind(layout.is_default)
        .bind(layout.configuration.encode())
        .bind(layout.updated_at)
        .bind(&layout.id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_default_layout(&self, workspace_id: &str) -> Result<Option<LayoutRecord>> {
        let row: Option<LayoutRow> = sqlx::query_as(&format!(
            "{SELECT_LAYOUT} WHERE workspace_id = ?1 AND is_default = 1 LIMIT 1"
        ))
        .bind(workspace_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_err)?;

        row.map(LayoutRecord::try_from).transpose()
    }

    async fn delete_workspace_layouts(&self, workspace_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM layouts WHERE workspace_id = ?1")
            .bind(workspace_id)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_process(&self, process: &UserProcessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_processes (
                id, pid, command, args, cwd, status, exit_code, auto_restart,
                restart_count, session_id, workspace_id, started_at, last_seen, ended_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&process.id)
        .bind(process.pid.map(|p| p as i64))
        .bind(&process.command)
        .bind(serde_json::to_string(&process.args)?)
        .bind(&process.cwd)
        .bind(process.status.as_str())
        .bind(process.exit_code)
        .bind(process.auto_restart)
        .bind(process.restart_count)
        .bind(&process.session_id)
        .bind(&process.workspace_id)
        .bind(process.started_at)
        .bind(process.last_seen)
        .bind(process.ended_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_process(&self, id: &str) -> Result<Option<UserProcessRecord>> {
        let row: Option<ProcessRow> =
            sqlx::query_as(&format!("{SELECT_PROCESS} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(storage_err)?;

        Ok(row.map(UserProcessRecord::from))
    }

    async fn update_process(&self, process: &UserProcessRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_processes
            SET pid = ?1, status = ?2, exit_code = ?3, auto_restart = ?4,
                restart_count = ?5, last_seen = ?6, ended_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(process.pid.map(|p| p as i64))
        .bind(process.status.as_str())
        .bind(process.exit_code)
        .bind(process.auto_restart)
        .bind(process.restart_count)
        .bind(process.last_seen)
        .bind(process.ended_at)
        .bind(&process.id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn list_processes(&self) -> Result<Vec<UserProcessRecord>> {
        let rows: Vec<ProcessRow> =
            sqlx::query_as(&format!("{SELECT_PROCESS} ORDER BY started_at"))
                .fetch_all(&*self.pool)
                .await
                .map_err(storage_err)?;

        Ok(rows.into_iter().map(UserProcessRecord::from).collect())
    }

    async fn list_running_processes(&self) -> Result<Vec<UserProcessRecord>> {
        let rows: Vec<ProcessRow> =
            sqlx::query_as(&format!("{SELECT_PROCESS} WHERE status = 'running'"))
                .fetch_all(&*self.pool)
                .await
                .map_err(storage_err)?;

        Ok(rows.into_iter().map(UserProcessRecord::from).collect())
    }

    async fn mark_all_running_stopped(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_processes
            SET status = 'stopped', ended_at = ?1
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn delete_dead_processes(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_processes
            WHERE status IN ('stopped', 'crashed', 'killed') AND ended_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_csrf_token(&self, token: &CsrfTokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO csrf_tokens (token, user_id, expires_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(&token.token)
        .bind(&token.user_id)
        .bind(token.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn delete_expired_csrf_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM csrf_tokens WHERE expires_at < ?1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (client_ip, key_prefix, request_time, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&record.client_ip)
        .bind(&record.key_prefix)
        .bind(record.request_time)
        .bind(record.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn delete_expired_rate_limits(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at < ?1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(result.rows_affected())
    }
}

const SELECT_SESSION: &str = r#"
    SELECT id, workspace_id, recovery_token, session_name, is_default_session,
           session_type, shell_pid, socket_id, status, current_working_dir,
           environment_vars, terminal_size, last_command, shell_history,
           session_timeout, max_idle_time, auto_cleanup, can_recover,
           created_at, last_activity_at, ended_at
    FROM sessions
"#;

const SELECT_LAYOUT: &str = r#"
    SELECT id, workspace_id, name, layout_type, is_default, configuration,
           created_at, updated_at
    FROM layouts
"#;

const SELECT_PROCESS: &str = r#"
    SELECT id, pid, command, args, cwd, status, exit_code, auto_restart,
           restart_count, session_id, workspace_id, started_at, last_seen, ended_at
    FROM user_processes
"#;

// Helper structs for sqlx query_as
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    workspace_id: String,
    recovery_token: String,
    session_name: String,
    is_default_session: bool,
    session_type: String,
    shell_pid: Option<i64>,
    socket_id: Option<String>,
    status: String,
    current_working_dir: Option<String>,
    environment_vars: Option<String>,
    terminal_size: Option<String>,
    last_command: Option<String>,
    shell_history: String,
    session_timeout: Option<i64>,
    max_idle_time: i64,
    auto_cleanup: bool,
    can_recover: bool,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for SessionRecord {
    fn from(r: SessionRow) -> Self {
        SessionRecord {
            id: r.id,
            workspace_id: r.workspace_id,
            recovery_token: r.recovery_token,
            session_name: r.session_name,
            is_default_session: r.is_default_session,
            session_type: r.session_type,
            shell_pid: r.shell_pid.map(|p| p as u32),
            socket_id: r.socket_id,
            status: parse_session_status(&r.status),
            current_working_dir: r.current_working_dir,
            environment_vars: r.environment_vars,
            terminal_size: r.terminal_size,
            last_command: r.last_command,
            shell_history: serde_json::from_str(&r.shell_history).unwrap_or_default(),
            session_timeout: r.session_timeout,
            max_idle_time: r.max_idle_time,
            auto_cleanup: r.auto_cleanup,
            can_recover: r.can_recover,
            created_at: r.created_at,
            last_activity_at: r.last_activity_at,
            ended_at: r.ended_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LayoutRow {
    id: String,
    workspace_id: String,
    name: String,
    layout_type: String,
    is_default: bool,
    configuration: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LayoutRow> for LayoutRecord {
    type Error = TermspaceError;

    fn try_from(r: LayoutRow) -> Result<Self> {
        Ok(LayoutRecord {
            layout_type: LayoutType::parse(&r.layout_type)?,
            configuration: LayoutConfig::decode(&r.configuration)?,
            id: r.id,
            workspace_id: r.workspace_id,
            name: r.name,
            is_default: r.is_default,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProcessRow {
    id: String,
    pid: Option<i64>,
    command: String,
    args: String,
    cwd: Option<String>,
    status: String,
    exit_code: Option<i32>,
    auto_restart: bool,
    restart_count: i64,
    session_id: Option<String>,
    workspace_id: Option<String>,
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<ProcessRow> for UserProcessRecord {
    fn from(r: ProcessRow) -> Self {
        UserProcessRecord {
            id: r.id,
            pid: r.pid.map(|p| p as u32),
            command: r.command,
            args: serde_json::from_str(&r.args).unwrap_or_default(),
            cwd: r.cwd,
            status: parse_process_status(&r.status),
            exit_code: r.exit_code,
            auto_restart: r.auto_restart,
            restart_count: r.restart_count,
            session_id: r.session_id,
            workspace_id: r.workspace_id,
            started_at: r.started_at,
            last_seen: r.last_seen,
            ended_at: r.ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use termspace_core::{PaneStatus, ProcessStatus};

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn sample_session(id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            workspace_id: "w1".to_string(),
            recovery_token: format!("token-{id}"),
            session_name: "Terminal 1".to_string(),
            is_default_session: false,
            session_type: "terminal".to_string(),
            shell_pid: Some(4242),
            socket_id: None,
            status,
            current_working_dir: Some("/tmp".to_string()),
            environment_vars: None,
            terminal_size: None,
            last_command: None,
            shell_history: Vec::new(),
            session_timeout: None,
            max_idle_time: 1440,
            auto_cleanup: true,
            can_recover: true,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (_dir, store) = temp_store().await;
        let mut session = sample_session("s1", SessionStatus::Active);
        session.push_shell_history("ls -la", Utc::now());
        store.insert_session(&session).await.unwrap();

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.recovery_token, "token-s1");
        assert_eq!(loaded.shell_pid, Some(4242));
        assert_eq!(loaded.shell_history.len(), 1);
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_mark_all_active_terminated() {
        let (_dir, store) = temp_store().await;
        store
            .insert_session(&sample_session("s1", SessionStatus::Active))
            .await
            .unwrap();
        store
            .insert_session(&sample_session("s2", SessionStatus::Paused))
            .await
            .unwrap();

        let count = store.mark_all_active_terminated(Utc::now()).await.unwrap();
        assert_eq!(count, 1);

        let s1 = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s1.status, SessionStatus::Terminated);
        assert!(s1.ended_at.is_some());
        assert!(!s1.can_recover);

        let s2 = store.get_session("s2").await.unwrap().unwrap();
        assert_eq!(s2.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_delete_expired_sessions_predicate() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        let mut old_terminated = sample_session("old-term", SessionStatus::Terminated);
        old_terminated.ended_at = Some(now - Duration::days(8));
        let mut old_paused = sample_session("old-paused", SessionStatus::Paused);
        old_paused.last_activity_at = now - Duration::days(8);
        let fresh = sample_session("fresh", SessionStatus::Paused);

        for s in [&old_terminated, &old_paused, &fresh] {
            store.insert_session(s).await.unwrap();
        }

        let deleted = store
            .delete_expired_sessions(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_session("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_count_sessions_by_status() {
        let (_dir, store) = temp_store().await;
        store
            .insert_session(&sample_session("a", SessionStatus::Active))
            .await
            .unwrap();
        store
            .insert_session(&sample_session("b", SessionStatus::Active))
            .await
            .unwrap();
        store
            .insert_session(&sample_session("c", SessionStatus::Terminated))
            .await
            .unwrap();

        let counts = store.count_sessions_by_status().await.unwrap();
        let active = counts
            .iter()
            .find(|(s, _)| *s == SessionStatus::Active)
            .map(|(_, n)| *n);
        assert_eq!(active, Some(2));
    }

    #[tokio::test]
    async fn test_layout_round_trip() {
        let (_dir, store) = temp_store().await;
        let layout = LayoutRecord {
            id: "l1".to_string(),
            workspace_id: "w1".to_string(),
            name: "Default".to_string(),
            layout_type: LayoutType::Single,
            is_default: true,
            configuration: LayoutConfig {
                layout_type: LayoutType::Single,
                panes: vec![termspace_core::Pane {
                    id: "pane-1".to_string(),
                    position: "main".to_string(),
                    grid_area: "1 / 1 / 2 / 2".to_string(),
                    tabs: vec![],
                    active_tab_id: None,
                    status: PaneStatus::Pending,
                }],
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_layout(&layout).await.unwrap();

        let loaded = store.get_default_layout("w1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "l1");
        assert_eq!(loaded.configuration.panes.len(), 1);

        assert_eq!(store.delete_workspace_layouts("w1").await.unwrap(), 1);
        assert!(store.get_layout("l1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_queries() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let process = UserProcessRecord {
            id: "p1".to_string(),
            pid: Some(999),
            command: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            cwd: Some("/tmp".to_string()),
            status: ProcessStatus::Running,
            exit_code: None,
            auto_restart: true,
            restart_count: 0,
            session_id: None,
            workspace_id: Some("w1".to_string()),
            started_at: now,
            last_seen: now,
            ended_at: None,
        };
        store.insert_process(&process).await.unwrap();

        let running = store.list_running_processes().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].args, vec!["run", "dev"]);

        assert_eq!(store.mark_all_running_stopped(now).await.unwrap(), 1);
        let loaded = store.get_process("p1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_auth_store_eviction() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        store
            .insert_csrf_token(&CsrfTokenRecord {
                token: "t1".to_string(),
                user_id: "u1".to_string(),
                expires_at: now - Duration::minutes(1),
            })
            .await
            .unwrap();
        store
            .insert_csrf_token(&CsrfTokenRecord {
                token: "t2".to_string(),
                user_id: "u1".to_string(),
                expires_at: now + Duration::minutes(30),
            })
            .await
            .unwrap();
        assert_eq!(store.delete_expired_csrf_tokens(now).await.unwrap(), 1);

        store
            .insert_rate_limit(&RateLimitRecord {
                id: 0,
                client_ip: "127.0.0.1".to_string(),
                key_prefix: "api".to_string(),
                request_time: now - Duration::minutes(20),
                expires_at: now - Duration::minutes(5),
            })
            .await
            .unwrap();
        assert_eq!(store.delete_expired_rate_limits(now).await.unwrap(), 1);
    }
}
