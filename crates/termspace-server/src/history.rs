//! Per-session scrollback history
//!
//! Output chunks land in a 2000-entry ring buffer and are mirrored to an
//! append-only log at `<history_dir>/<workspace_id>_<session_id>.log`,
//! one `millis|base64(chunk)` line each. The disk side runs in its own
//! task fed by an unbounded channel, so a slow disk can never stall the
//! PTY reader; append failures are logged and dropped. On open, the tail
//! of the log is restored into the ring so replays include prior-run
//! scrollback.

use std::path::{Path, PathBuf};

use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use termspace_core::{Result, RingBuffer};

pub const HISTORY_RING_CAPACITY: usize = 2000;

pub struct SessionHistory {
    ring: RwLock<RingBuffer<Bytes>>,
    appender_tx: mpsc::UnboundedSender<Bytes>,
    log_path: PathBuf,
}

impl SessionHistory {
    /// Open (or create) the history for a session, restoring the log
    /// tail into the ring before returning.
    pub async fn open(history_dir: &Path, workspace_id: &str, session_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(history_dir).await?;
        let log_path = history_dir.join(format!("{workspace_id}_{session_id}.log"));

        let mut ring = RingBuffer::new(HISTORY_RING_CAPACITY)?;
        match tokio::fs::read_to_string(&log_path).await {
            Ok(contents) => {
                let mut restored = 0usize;
                for line in contents.lines() {
                    if let Some(chunk) = decode_line(line) {
                        ring.push(chunk);
                        restored += 1;
                    }
                }
                debug!(
                    "Restored {} history chunks for session {} ({} kept)",
                    restored,
                    session_id,
                    ring.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to read history log {:?}: {}", log_path, e);
            }
        }

        let (appender_tx, appender_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_appender(log_path.clone(), appender_rx));

        Ok(Self {
            ring: RwLock::new(ring),
            appender_tx,
            log_path,
        })
    }

    /// Record an output chunk. The ring is updated before this returns;
    /// the disk append is queued and best-effort.
    pub async fn write(&self, data: Bytes) {
        self.ring.write().await.push(data.clone());
        let _ = self.appender_tx.send(data);
    }

    /// Snapshot of the ring, oldest chunk first.
    pub async fn get_recent(&self) -> Vec<Bytes> {
        self.ring.read().await.get_all()
    }

    pub async fn is_empty(&self) -> bool {
        self.ring.read().await.is_empty()
    }

    /// Drop the in-memory ring and unlink the log file.
    pub async fn clear(&self) -> Result<()> {
        self.ring.write().await.clear();
        match tokio::fs::remove_file(&self.log_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Parse one `millis|base64(payload)` line; malformed lines are skipped.
fn decode_line(line: &str) -> Option<Bytes> {
    let (millis, payload) = line.split_once('|')?;
    millis.parse::<i64>().ok()?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload.trim_end())
        .ok()?;
    Some(Bytes::from(decoded))
}

fn encode_line(data: &[u8]) -> String {
    format!(
        "{}|{}\n",
        Utc::now().timestamp_millis(),
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

async fn run_appender(log_path: PathBuf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        let line = encode_line(&data);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to append history log {:?}: {}", log_path, e);
        }
    }
}
