//! Types for the scheduler module.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::AccountError;
use crate::job::JobError;
use crate::queue::QueueError;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    /// Failed, returned to `pending` and re-enqueued.
    Retrying,
    /// Failed with the retry budget exhausted.
    Failed,
    /// Nothing to do: missing, no longer pending, or cancelled mid-run.
    Skipped,
    /// Owner at its concurrency limit; re-enqueued with a delay.
    Deferred,
}

/// Snapshot of the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub running: bool,
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub queued_jobs: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Job(#[from] JobError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("account error: {0}")]
    Account(#[from] AccountError),

    #[error("worker pool is shut down")]
    ShutDown,
}

#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pub total_processed: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_retried: AtomicU64,
}

impl PoolStats {
    pub fn record(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed => &self.total_processed,
            JobOutcome::Failed => &self.total_failed,
            JobOutcome::Retrying => &self.total_retried,
            JobOutcome::Skipped | JobOutcome::Deferred => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_status(
        &self,
        running: bool,
        active_jobs: usize,
        max_concurrent: usize,
        queued_jobs: usize,
    ) -> PoolStatus {
        PoolStatus {
            running,
            active_jobs,
            max_concurrent,
            queued_jobs,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
        }
    }
}
