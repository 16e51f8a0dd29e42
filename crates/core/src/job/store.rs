//! Job storage trait and request types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Job, JobStatus, JobTransition};

/// Error type for job operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid transition '{transition}' for job {job_id} in status {from}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        transition: &'static str,
    },

    #[error("cannot {operation} job {job_id}: current status is {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl JobError {
    /// Whether the error means the job moved on underneath the caller.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            JobError::InvalidTransition { .. } | JobError::InvalidState { .. }
        )
    }
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        JobError::Database(e.to_string())
    }
}

/// Request to create a new pending job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub owner: String,
    pub input_filename: String,
    /// Lower-cased input format.
    pub input_format: String,
    /// Lower-cased output format.
    pub output_format: String,
    pub file_size: u64,
}

/// Non-status fields that may change while a job is processing.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub progress: Option<u8>,
}

impl JobUpdate {
    pub fn progress(percent: u8) -> Self {
        Self {
            progress: Some(percent),
        }
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner: Option<String>,
    /// Only jobs whose `completed_at` is strictly earlier than this instant.
    pub completed_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            owner: None,
            completed_before: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_completed_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.completed_before = Some(cutoff);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for job storage backends.
///
/// Implementations must make [`JobStore::transition`] atomic: two callers
/// racing the same transition see exactly one success.
pub trait JobStore: Send + Sync {
    /// Create a new job in `pending` status.
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError>;

    /// Get a job by ID.
    fn get(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// Apply non-status updates.
    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, JobError>;

    /// Apply a lifecycle transition.
    fn transition(&self, id: &str, transition: JobTransition) -> Result<Job, JobError>;

    /// Permanently delete a job. Returns the deleted job.
    fn delete(&self, id: &str) -> Result<Job, JobError>;

    /// List jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Count jobs matching the filter.
    fn count(&self, filter: &JobFilter) -> Result<i64, JobError>;
}
