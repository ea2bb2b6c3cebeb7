//! Termspace server
//!
//! Single-tenant web terminal multiplexer: persistent shell sessions
//! bound to per-repository workspaces, multiplexed to browser sockets
//! over WebSocket.
//!
//! Uses SQLite (embedded) for persistence; everything else is in-process.

mod cleanup;
mod clock;
mod config;
mod history;
mod layout;
mod mux;
mod sessions;
mod storage;
mod supervisor;
mod transport;
mod workspace;
mod ws;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cleanup::CleanupService;
use clock::{Clock, SystemClock};
use config::Settings;
use layout::LayoutEngine;
use mux::PtyMultiplexer;
use sessions::SessionManager;
use storage::{SessionStore, SqliteStore};
use supervisor::{ProcessSupervisor, TokioSpawner};
use transport::ClientTransport;
use workspace::ConfigWorkspaceService;
use ws::WsTransport;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<WsTransport>,
    pub mux: PtyMultiplexer,
    pub sessions: SessionManager,
    pub supervisor: ProcessSupervisor,
    pub cleanup: CleanupService,
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        eprintln!("[PANIC] at {:?}: {}", location, info);
        tracing::error!("PANIC at {:?}: {}", location, info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting termspace server v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    if let Err(e) = run_server().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    info!(
        "Config loaded: bind={}, db={}, {} workspaces",
        settings.bind_address,
        settings.database_path,
        settings.workspaces.len()
    );

    let store: Arc<dyn SessionStore> = Arc::new(
        SqliteStore::new(&settings.database_path)
            .await
            .context("Failed to initialize database")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let workspaces = Arc::new(ConfigWorkspaceService::new(settings.workspaces.clone()));

    let sessions = SessionManager::new(store.clone(), clock.clone()).await;
    let layouts = Arc::new(LayoutEngine::new(store.clone(), clock.clone()));
    let supervisor = ProcessSupervisor::new(store.clone(), Arc::new(TokioSpawner), clock.clone());
    let cleanup = CleanupService::new(store.clone(), clock.clone());

    let transport = Arc::new(WsTransport::new());
    let mux = PtyMultiplexer::new(
        sessions.clone(),
        layouts,
        supervisor.clone(),
        workspaces,
        transport.clone() as Arc<dyn ClientTransport>,
        settings.history_dir.clone(),
    );

    sessions.start().await;
    mux.start().await;
    supervisor.start().await;
    cleanup.start().await;

    let state = AppState {
        transport,
        mux: mux.clone(),
        sessions: sessions.clone(),
        supervisor: supervisor.clone(),
        cleanup: cleanup.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_address))?;
    info!("Listening on {}", settings.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    mux.shutdown().await;
    supervisor.stop().await;
    cleanup.stop().await;
    sessions.cleanup().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.get_session_statistics().await;
    let supervisor = state.supervisor.get_status().await;
    let cleanup = state.cleanup.get_status().await;
    axum::Json(serde_json::json!({
        "sessions": sessions,
        "supervisor": supervisor,
        "cleanup": cleanup,
    }))
}
