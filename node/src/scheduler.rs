//! Background tasks: retention, automatic backups and sync.

use crate::backup::{BackupEngine, BackupOptions};
use crate::error::Result;
use crate::retention::RetentionManager;
use crate::session::Session;
use crate::sync::SyncWorker;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Name of archives written by the automatic backup task.
pub const AUTO_BACKUP_NAME: &str = "auto";

/// Periodic tasks sharing one shutdown signal.
///
/// Every tick is skipped while a restore is in progress.
#[derive(Debug)]
pub struct Scheduler {
    session: Session,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(session: Session) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            session,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn every_retention(&mut self, retention: RetentionManager, period: Duration) {
        self.spawn_task("retention", period, move || {
            let retention = retention.clone();
            async move {
                let report = retention.run().await?;
                if !report.deleted.is_empty() || report.purged_changes > 0 {
                    info!(
                        deleted = report.deleted.len(),
                        purged_changes = report.purged_changes,
                        "scheduled retention"
                    );
                }
                Ok(())
            }
        });
    }

    pub fn every_backup(&mut self, backup: BackupEngine, period: Duration, options: BackupOptions) {
        self.spawn_task("backup", period, move || {
            let backup = backup.clone();
            let options = options.clone();
            async move {
                backup.create_backup(AUTO_BACKUP_NAME, None, options).await?;
                Ok(())
            }
        });
    }

    pub fn every_sync(&mut self, worker: SyncWorker, period: Duration) {
        self.spawn_task("sync", period, move || {
            let worker = worker.clone();
            async move {
                worker.run_once().await?;
                Ok(())
            }
        });
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn spawn_task<F, Fut>(&mut self, task: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let session = self.session.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if session.is_restoring() {
                    debug!(task, "restore in progress; tick skipped");
                    continue;
                }
                match job().await {
                    Ok(()) => debug!(task, "scheduled run finished"),
                    Err(e) => warn!(task, error = %e, "scheduled run failed"),
                }
            }
            debug!(task, "task stopped");
        });
        debug!(task, period_secs = period.as_secs(), "task scheduled");
        self.handles.push(handle);
    }

    /// Signal every task and wait for them to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
    }
}
