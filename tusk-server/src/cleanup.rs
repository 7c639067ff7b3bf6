//! Periodic reclamation of expired and abandoned uploads

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tusk_core::*;
use tusk_engine::{AdmissionQueue, UploadStore};

use crate::repository::UploadRepository;

const FALLBACK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
    pub lock_ttl: Duration,
    pub purge_expired_records: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for CleanupConfig {
    fn from(config: &UploadConfig) -> Self {
        CleanupConfig {
            interval: config.cleanup_interval(),
            idle_timeout: config.idle_timeout(),
            lock_ttl: config.lock_ttl(),
            purge_expired_records: config.purge_expired_records,
        }
    }
}

/// What a single cleanup cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Sessions reclaimed because their expiry passed
    pub expired: usize,
    /// Sessions reclaimed because they stopped making progress
    pub abandoned: usize,
    pub locks_swept: usize,
    /// Per-item failures, each already logged
    pub errors: usize,
}

struct DaemonInner {
    store: UploadStore,
    repositories: Vec<Arc<dyn UploadRepository>>,
    queue: Option<Arc<AdmissionQueue>>,
    config: CleanupConfig,
}

type RunningTask = (JoinHandle<()>, oneshot::Sender<()>);

pub struct CleanupDaemon {
    inner: Arc<DaemonInner>,
    is_running: AtomicBool,
    task: Mutex<Option<RunningTask>>,
}

impl CleanupDaemon {
    pub fn new(
        store: UploadStore,
        repositories: Vec<Arc<dyn UploadRepository>>,
        config: CleanupConfig,
    ) -> Self {
        CleanupDaemon {
            inner: Arc::new(DaemonInner {
                store,
                repositories,
                queue: None,
                config,
            }),
            is_running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Also release reclaimed uploads from this admission queue
    pub fn with_queue(self, queue: Arc<AdmissionQueue>) -> Self {
        let inner = DaemonInner {
            store: self.inner.store.clone(),
            repositories: self.inner.repositories.clone(),
            queue: Some(queue),
            config: self.inner.config.clone(),
        };
        CleanupDaemon {
            inner: Arc::new(inner),
            ..self
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Run one cycle immediately on the current task
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle(Utc::now()).await
    }

    /// Spawn the periodic loop on the current tokio runtime
    ///
    /// Returns `false` when the daemon was already running.
    pub fn start(&self) -> bool {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Cleanup daemon already running");
            return false;
        }

        let period = match self.inner.config.interval {
            d if d.is_zero() => FALLBACK_INTERVAL,
            d => d,
        };

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let report = inner.run_cycle(Utc::now()).await;
                        if report.errors > 0 {
                            warn!(
                                expired = report.expired,
                                abandoned = report.abandoned,
                                errors = report.errors,
                                "Cleanup cycle finished with errors"
                            );
                        } else {
                            debug!(
                                expired = report.expired,
                                abandoned = report.abandoned,
                                locks_swept = report.locks_swept,
                                "Cleanup cycle finished"
                            );
                        }
                    }
                }
            }
        });

        match self.task.lock() {
            Ok(mut task) => *task = Some((handle, stop_tx)),
            Err(poisoned) => *poisoned.into_inner() = Some((handle, stop_tx)),
        }

        info!(interval_secs = period.as_secs(), "Cleanup daemon started");
        true
    }

    /// Stop the loop and wait for it to exit
    ///
    /// Returns `false` when the daemon was not running.
    pub async fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some((handle, stop_tx)) = task {
            // The task may already be gone, in which case the send fails
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                error!("Cleanup daemon task failed: {}", e);
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Cleanup daemon stopped");
        true
    }
}

impl DaemonInner {
    async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let idle = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let idle_cutoff = now.checked_sub_signed(idle).unwrap_or(DateTime::<Utc>::MIN_UTC);

        for repo in &self.repositories {
            self.reclaim_expired(repo.as_ref(), now, &mut report).await;
            self.reclaim_abandoned(repo.as_ref(), idle_cutoff, &mut report).await;
        }

        match self.store.sweep_locks(self.config.lock_ttl) {
            Ok(swept) => report.locks_swept = swept,
            Err(e) => {
                warn!("Lock sweep failed: {}", e);
                report.errors += 1;
            }
        }

        if report.expired + report.abandoned > 0 {
            info!(
                expired = report.expired,
                abandoned = report.abandoned,
                locks_swept = report.locks_swept,
                "Reclaimed stale uploads"
            );
        }

        report
    }

    async fn reclaim_expired(
        &self,
        repo: &dyn UploadRepository,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let sessions = match repo.expired_sessions(now).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(domain = repo.domain(), "Listing expired sessions failed: {}", e);
                report.errors += 1;
                return;
            }
        };

        for session in sessions {
            match self.reclaim(repo, &session.id, UploadStatus::Expired).await {
                Ok(()) => report.expired += 1,
                Err(e) => {
                    warn!(domain = repo.domain(), id = %session.id, "Expiring session failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    async fn reclaim_abandoned(
        &self,
        repo: &dyn UploadRepository,
        cutoff: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let sessions = match repo.active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(domain = repo.domain(), "Listing active sessions failed: {}", e);
                report.errors += 1;
                return;
            }
        };

        for session in sessions.into_iter().filter(|s| s.is_idle_since(cutoff)) {
            match self.reclaim(repo, &session.id, UploadStatus::Failed).await {
                Ok(()) => report.abandoned += 1,
                Err(e) => {
                    warn!(domain = repo.domain(), id = %session.id, "Abandoning session failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Remove store state, free the queue slot and record the outcome
    async fn reclaim(&self, repo: &dyn UploadRepository, id: &UploadId, status: UploadStatus) -> Result<()> {
        let store = self.store.clone();
        let target = id.clone();
        tokio::task::spawn_blocking(move || store.terminate(&target))
            .await
            .map_err(|e| TuskError::Internal(format!("terminate task failed: {}", e)))??;

        if let Some(queue) = &self.queue {
            queue.finish_upload(id.as_str());
        }

        if status == UploadStatus::Expired && self.config.purge_expired_records {
            repo.delete(id).await?;
        } else {
            repo.update_status(id, status).await?;
        }

        debug!(domain = repo.domain(), id = %id, status = %status, "Reclaimed upload");
        Ok(())
    }
}
