//! Admission control: decides whether a submission becomes a job.
//!
//! Checks run in a fixed order and the first failure rejects the
//! submission without creating anything:
//!
//! 1. the filename and format pair are valid and routable,
//! 2. the declared size is within `max_file_size`,
//! 3. the owner's storage account can hold the file.
//!
//! After staging, the upload must be exactly the declared size, otherwise
//! the submission is rejected and rolled back.
//!
//! A lack of free execution slots never rejects; the job is accepted and
//! reported as deferred.

mod controller;

pub use controller::AdmissionController;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::AccountError;
use crate::job::{Job, JobError};
use crate::queue::QueueError;
use crate::storage::{StageMode, StorageError};

/// A conversion request as received from a client.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner: String,
    /// Where the uploaded bytes currently are.
    pub source_path: PathBuf,
    /// Client-supplied file name. Only its last path component is kept.
    pub input_filename: String,
    /// Explicit input format; derived from the filename when absent.
    pub input_format: Option<String>,
    pub output_format: String,
    /// Declared upload size in bytes.
    pub file_size: u64,
    pub stage_mode: StageMode,
}

impl SubmitRequest {
    /// Build a request for a file on disk, taking name and size from it.
    pub async fn for_file(
        owner: impl Into<String>,
        path: impl AsRef<Path>,
        output_format: impl Into<String>,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let input_filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            owner: owner.into(),
            source_path: path.to_path_buf(),
            input_filename,
            input_format: None,
            output_format: output_format.into(),
            file_size: metadata.len(),
            stage_mode: StageMode::Move,
        })
    }

    pub fn with_stage_mode(mut self, mode: StageMode) -> Self {
        self.stage_mode = mode;
        self
    }

    pub fn with_input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = Some(format.into());
        self
    }
}

/// Result of the admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Admission {
    /// A global execution slot is free now.
    Admitted,
    /// All global slots are busy; the job waits in the queue.
    Deferred { processing: usize },
}

/// An accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job: Job,
    pub admission: Admission,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid submission: {reason}")]
    Validation { reason: String },

    #[error("file too large: {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("storage quota exceeded for {owner}: {used} of {quota} bytes used, {requested} requested")]
    QuotaExceeded {
        owner: String,
        used: u64,
        quota: u64,
        requested: u64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("job store error: {0}")]
    Job(#[from] JobError),

    #[error("account error: {0}")]
    Account(#[from] AccountError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl AdmissionError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Whether the submission itself was refused, as opposed to an
    /// infrastructure failure while accepting it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::FileTooLarge { .. } | Self::QuotaExceeded { .. }
        )
    }
}
