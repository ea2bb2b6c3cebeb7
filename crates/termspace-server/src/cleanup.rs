//! Cleanup coordinator
//!
//! Four independent periodic jobs evicting expired rows: CSRF tokens,
//! rate-limit records, old sessions, and dead process rows. Each job
//! runs once shortly after start, then at its own interval; a failing
//! pass is logged and the job keeps running.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info};

use termspace_core::Result;

use crate::clock::Clock;
use crate::storage::SessionStore;

const INITIAL_DELAY: Duration = Duration::from_secs(1);

const CSRF_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SESSION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const PROCESS_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Session and process rows are kept for a week after they end.
const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Job {
    CsrfTokens,
    RateLimits,
    Sessions,
    Processes,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::CsrfTokens => "csrf-tokens",
            Job::RateLimits => "rate-limits",
            Job::Sessions => "sessions",
            Job::Processes => "processes",
        }
    }

    fn interval(&self) -> Duration {
        match self {
            Job::CsrfTokens => CSRF_INTERVAL,
            Job::RateLimits => RATE_LIMIT_INTERVAL,
            Job::Sessions => SESSION_INTERVAL,
            Job::Processes => PROCESS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub csrf_tokens: bool,
    pub rate_limits: bool,
    pub sessions: bool,
    pub processes: bool,
}

#[derive(Clone)]
pub struct CleanupService {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    jobs: Arc<Mutex<HashMap<Job, JoinHandle<()>>>>,
}

impl CleanupService {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start(&self) {
        let mut jobs = self.jobs.lock().await;
        for job in [Job::CsrfTokens, Job::RateLimits, Job::Sessions, Job::Processes] {
            if jobs.contains_key(&job) {
                continue;
            }
            let service = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(INITIAL_DELAY).await;
                loop {
                    match service.run_job(job).await {
                        Ok(0) => {}
                        Ok(count) => debug!("Cleanup job {} evicted {} rows", job.name(), count),
                        Err(e) => error!("Cleanup job {} failed: {}", job.name(), e),
                    }
                    tokio::time::sleep(job.interval()).await;
                }
            });
            jobs.insert(job, handle);
        }
        info!("Cleanup service started ({} jobs)", jobs.len());
    }

    async fn run_job(&self, job: Job) -> Result<u64> {
        let now = self.clock.now();
        match job {
            Job::CsrfTokens => self.store.delete_expired_csrf_tokens(now).await,
            Job::RateLimits => self.store.delete_expired_rate_limits(now).await,
            Job::Sessions => {
                self.store
                    .delete_expired_sessions(now - ChronoDuration::days(RETENTION_DAYS))
                    .await
            }
            Job::Processes => {
                self.store
                    .delete_dead_processes(now - ChronoDuration::days(RETENTION_DAYS))
                    .await
            }
        }
    }

    /// Cancel every job. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut jobs = self.jobs.lock().await;
        for (job, handle) in jobs.drain() {
            handle.abort();
            debug!("Cleanup job {} cancelled", job.name());
        }
    }

    pub async fn get_status(&self) -> CleanupStatus {
        let jobs = self.jobs.lock().await;
        let active = |job: Job| jobs.get(&job).map(|h| !h.is_finished()).unwrap_or(false);
        CleanupStatus {
            csrf_tokens: active(Job::CsrfTokens),
            rate_limits: active(Job::RateLimits),
            sessions: active(Job::Sessions),
            processes: active(Job::Processes),
        }
    }
}
