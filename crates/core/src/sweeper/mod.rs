//! Retention sweeper: removes terminal jobs and their files once they are
//! older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::{JobError, JobFilter, JobStore};
use crate::storage::ArtifactLayout;

/// Jobs examined per store query.
const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("job store error: {0}")]
    Job(#[from] JobError),
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Job records deleted.
    pub jobs_removed: usize,
    /// Artifact directories deleted.
    pub dirs_removed: usize,
    /// Directories that could not be deleted; their records were still
    /// removed.
    pub errors: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    layout: ArtifactLayout,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, layout: ArtifactLayout, retention: chrono::Duration) -> Self {
        Self {
            store,
            layout,
            retention,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        self.sweep_at(Utc::now()).await
    }

    /// Remove every terminal job whose `completed_at` is before
    /// `now - retention`. Safe to run repeatedly or concurrently.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let cutoff = now - self.retention;
        let mut report = SweepReport::default();

        loop {
            let filter = JobFilter::new()
                .with_completed_before(cutoff)
                .with_limit(SWEEP_BATCH);
            let expired = self.store.list(&filter)?;
            if expired.is_empty() {
                break;
            }

            let mut removed_in_batch = 0;
            for job in expired.into_iter().filter(|job| job.is_terminal()) {
                match self.layout.remove_job_dirs(&job.id).await {
                    Ok(count) => report.dirs_removed += count,
                    Err(e) => {
                        warn!("Failed to remove files of job {}: {}", job.id, e);
                        report.errors += 1;
                    }
                }

                match self.store.delete(&job.id) {
                    Ok(_) => {
                        report.jobs_removed += 1;
                        removed_in_batch += 1;
                    }
                    // Another sweeper got there first
                    Err(JobError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if removed_in_batch == 0 {
                break;
            }
        }

        if report.jobs_removed > 0 {
            info!(
                "Retention sweep removed {} job(s), {} directories",
                report.jobs_removed, report.dirs_removed
            );
        } else {
            debug!("Retention sweep found nothing to remove");
        }

        Ok(report)
    }

    /// Run `sweep` every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retention sweeper started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(e) = self.sweep().await {
                    error!("Retention sweep failed: {}", e);
                }
            }
            info!("Retention sweeper stopped");
        })
    }
}
