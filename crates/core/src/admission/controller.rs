//! Admission controller implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, error, info, warn};

use super::{Admission, AdmissionError, SubmitRequest, Submission};
use crate::account::AccountStore;
use crate::config::EngineConfig;
use crate::converter::{format_from_filename, normalize_format, ConverterRegistry};
use crate::job::{CreateJobRequest, Job, JobFilter, JobStatus, JobStore};
use crate::queue::TaskQueue;
use crate::scheduler::SlotLimiter;
use crate::storage::{sanitize_filename, ArtifactLayout, StageMode};

/// A submission that passed validation, with normalised fields.
struct Checked {
    input_filename: String,
    input_format: String,
    output_format: String,
    admission: Admission,
}

pub struct AdmissionController {
    config: EngineConfig,
    registry: ConverterRegistry,
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStore>,
    queue: Arc<dyn TaskQueue>,
    layout: ArtifactLayout,
    slots: SlotLimiter,
}

impl AdmissionController {
    pub fn new(
        config: EngineConfig,
        registry: ConverterRegistry,
        store: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStore>,
        queue: Arc<dyn TaskQueue>,
        layout: ArtifactLayout,
        slots: SlotLimiter,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            accounts,
            queue,
            layout,
            slots,
        }
    }

    /// Run the admission checks without creating anything.
    pub fn admit(&self, request: &SubmitRequest) -> Result<Admission, AdmissionError> {
        self.check(request).map(|checked| checked.admission)
    }

    fn check(&self, request: &SubmitRequest) -> Result<Checked, AdmissionError> {
        if request.owner.trim().is_empty() {
            return Err(AdmissionError::validation("owner is required"));
        }

        let input_filename = sanitize_filename(&request.input_filename)
            .map_err(|e| AdmissionError::validation(e.to_string()))?;

        let input_format = match request.input_format.as_deref() {
            Some(format) => normalize_format(format),
            None => format_from_filename(&input_filename).ok_or_else(|| {
                AdmissionError::validation(format!(
                    "cannot determine the format of {}",
                    input_filename
                ))
            })?,
        };
        let output_format = normalize_format(&request.output_format);

        self.registry
            .validate_pair(&input_format, &output_format)
            .map_err(|e| AdmissionError::validation(e.to_string()))?;

        if request.file_size > self.config.max_file_size {
            return Err(AdmissionError::FileTooLarge {
                size: request.file_size,
                max: self.config.max_file_size,
            });
        }

        let account = self
            .accounts
            .get_or_create(&request.owner, self.config.default_quota_bytes)?;
        if !account.can_store(request.file_size) {
            return Err(AdmissionError::QuotaExceeded {
                owner: request.owner.clone(),
                used: account.used_bytes,
                quota: account.quota_bytes,
                requested: request.file_size,
            });
        }

        // The store sees jobs run by other processes sharing it
        let processing = self
            .store
            .count(&JobFilter::new().with_status(JobStatus::Processing))?
            .max(0) as usize;
        let processing = processing.max(self.slots.in_use());
        let admission = if processing < self.slots.max_global() {
            Admission::Admitted
        } else {
            Admission::Deferred { processing }
        };

        Ok(Checked {
            input_filename,
            input_format,
            output_format,
            admission,
        })
    }

    /// Admit, create the pending job, stage its input and enqueue it.
    ///
    /// If staging or enqueueing fails the job record is removed again and a
    /// moved upload is put back, so a failed submission leaves nothing behind.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, AdmissionError> {
        let checked = match self.check(&request) {
            Ok(checked) => checked,
            Err(e) => {
                debug!("Rejected submission from {}: {}", request.owner, e);
                return Err(e);
            }
        };

        let job = self.store.create(CreateJobRequest {
            owner: request.owner.clone(),
            input_filename: checked.input_filename,
            input_format: checked.input_format,
            output_format: checked.output_format,
            file_size: request.file_size,
        })?;

        let staged = match self
            .layout
            .stage_upload(&job, &request.source_path, request.stage_mode)
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                warn!("Failed to stage job {}: {}, rolling back", job.id, e);
                self.roll_back(&job, None, &request).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.accept_staged(&job, &staged).await {
            warn!("Failed to accept job {}: {}, rolling back", job.id, e);
            self.roll_back(&job, Some(&staged), &request).await;
            return Err(e);
        }

        match checked.admission {
            Admission::Admitted => info!(
                "Accepted job {} for {}: {} -> {} ({} bytes)",
                job.id, job.owner, job.input_format, job.output_format, job.file_size
            ),
            Admission::Deferred { processing } => info!(
                "Accepted job {} for {} ({} jobs processing, queued)",
                job.id, job.owner, processing
            ),
        }

        Ok(Submission {
            job,
            admission: checked.admission,
        })
    }

    /// Confirm the staged file is the size that was checked, then enqueue.
    async fn accept_staged(&self, job: &Job, staged: &Path) -> Result<(), AdmissionError> {
        let staged_size = fs::metadata(staged)
            .await
            .map_err(|e| AdmissionError::validation(format!("cannot read staged upload: {}", e)))?
            .len();
        if staged_size != job.file_size {
            return Err(AdmissionError::validation(format!(
                "declared size of {} bytes does not match the {} byte upload",
                job.file_size, staged_size
            )));
        }

        self.queue.enqueue(&job.id, Duration::ZERO).await?;
        Ok(())
    }

    /// Remove the job record and its directories. A moved upload is put
    /// back first; if that fails the staged copy is kept.
    async fn roll_back(&self, job: &Job, staged: Option<&Path>, request: &SubmitRequest) {
        if let Err(e) = self.store.delete(&job.id) {
            warn!("Failed to delete job {} during rollback: {}", job.id, e);
        }

        if let (Some(staged), StageMode::Move) = (staged, request.stage_mode) {
            if let Err(e) = self.layout.restore_upload(staged, &request.source_path).await {
                error!(
                    "Failed to restore upload of job {}, kept at {}: {}",
                    job.id,
                    staged.display(),
                    e
                );
                return;
            }
        }

        if let Err(e) = self.layout.remove_job_dirs(&job.id).await {
            warn!("Failed to remove files of job {}: {}", job.id, e);
        }
    }
}
