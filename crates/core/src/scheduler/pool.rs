//! Worker pool: pulls job ids off the queue and runs them under the slot
//! limits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::cancel::CancellationRegistry;
use super::retry::{RetryDecision, RetryPolicy};
use super::slots::{GlobalSlot, SlotLimiter, SlotPermit};
use super::types::{JobOutcome, PoolStats, PoolStatus, SchedulerError};
use crate::account::AccountStore;
use crate::config::EngineConfig;
use crate::converter::{
    ConversionProgress, ConversionRequest, ConversionResult, ConverterError, ConverterRegistry,
};
use crate::job::{Job, JobFilter, JobStatus, JobStore, JobTransition, JobUpdate};
use crate::queue::{Delivery, TaskQueue};
use crate::storage::ArtifactLayout;

/// Capacity of the per-job progress channel.
const PROGRESS_BUFFER: usize = 16;

/// Runs queued jobs with bounded concurrency.
pub struct WorkerPool {
    worker: Arc<Worker>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tracker: TaskTracker,
}

/// Everything a single job execution needs; shared by all worker tasks.
struct Worker {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStore>,
    queue: Arc<dyn TaskQueue>,
    registry: ConverterRegistry,
    layout: ArtifactLayout,
    slots: SlotLimiter,
    cancellations: CancellationRegistry,
    retry: RetryPolicy,
    stats: PoolStats,
}

impl WorkerPool {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStore>,
        queue: Arc<dyn TaskQueue>,
        registry: ConverterRegistry,
        layout: ArtifactLayout,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let slots = SlotLimiter::new(
            config.max_concurrent_processes,
            config.max_concurrent_per_user,
        );

        Self {
            worker: Arc::new(Worker {
                retry: RetryPolicy::new(config.max_retries),
                config,
                store,
                accounts,
                queue,
                registry,
                layout,
                slots,
                cancellations: CancellationRegistry::new(),
                stats: PoolStats::default(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tracker: TaskTracker::new(),
        }
    }

    /// Slot accounting, shared with admission.
    pub fn slots(&self) -> &SlotLimiter {
        &self.worker.slots
    }

    /// Tokens of the jobs this pool is executing.
    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.worker.cancellations
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the dispatcher.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running");
            return;
        }

        info!(
            "Starting worker pool ({} slots, {} per user)",
            self.worker.slots.max_global(),
            self.worker.slots.max_per_owner()
        );

        self.recover_interrupted().await;
        self.spawn_dispatcher();
    }

    /// Stop taking new work and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Worker pool not running");
            return;
        }

        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        info!("Worker pool stopped");
    }

    pub async fn status(&self) -> PoolStatus {
        let queued = self.worker.queue.len().await.unwrap_or(0);
        self.worker.stats.to_status(
            self.is_running(),
            self.worker.cancellations.active(),
            self.worker.slots.max_global(),
            queued,
        )
    }

    /// Run one job to an outcome, waiting for a global slot first.
    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome, SchedulerError> {
        let slot = self
            .worker
            .slots
            .acquire_global()
            .await
            .map_err(|_| SchedulerError::ShutDown)?;
        let outcome = self.worker.process(job_id, slot).await?;
        self.worker.stats.record(outcome);
        Ok(outcome)
    }

    /// Jobs found `processing` at startup were interrupted by a previous
    /// shutdown or crash. Each counts as a failed attempt.
    pub async fn recover_interrupted(&self) {
        let filter = JobFilter::new()
            .with_status(JobStatus::Processing)
            .with_limit(i64::MAX);
        let jobs = match self.worker.store.list(&filter) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to list interrupted jobs: {}", e);
                return;
            }
        };

        for job in jobs {
            let Some(_guard) = self.worker.cancellations.claim(&job.id) else {
                continue;
            };
            info!("Recovering interrupted job {}", job.id);
            match self
                .worker
                .fail_or_retry(&job, interrupted_error(), job.tool_used.clone())
                .await
            {
                Ok(outcome) => debug!("Recovered job {}: {:?}", job.id, outcome),
                Err(e) => error!("Failed to recover job {}: {}", job.id, e),
            }
        }
    }

    fn spawn_dispatcher(&self) {
        let worker = Arc::clone(&self.worker);
        let tracker = self.tracker.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = worker.config.poll_interval();

        tokio::spawn(async move {
            debug!("Dispatcher loop started");

            loop {
                let slot = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    slot = worker.slots.acquire_global() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                };

                let delivery = match worker.queue.dequeue().await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        drop(slot);
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(poll_interval) => continue,
                        }
                    }
                    Err(e) => {
                        error!("Failed to dequeue: {}", e);
                        drop(slot);
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(poll_interval) => continue,
                        }
                    }
                };

                let worker = Arc::clone(&worker);
                tracker.spawn(async move {
                    worker.handle_delivery(delivery, slot).await;
                });
            }

            debug!("Dispatcher loop stopped");
        });
    }
}

fn interrupted_error() -> ConverterError {
    ConverterError::Io(std::io::Error::other("interrupted before completion"))
}

impl Worker {
    /// Process a delivery and ack it. Errors are logged; an unacked
    /// delivery comes back after its lease expires.
    async fn handle_delivery(&self, delivery: Delivery, slot: GlobalSlot) {
        if delivery.is_redelivery() {
            debug!(
                "Delivery #{} of job {}",
                delivery.delivery_count, delivery.job_id
            );
        }

        match self.process(&delivery.job_id, slot).await {
            Ok(outcome) => {
                self.stats.record(outcome);
                debug!("Job {} delivery handled: {:?}", delivery.job_id, outcome);
                if let Err(e) = self.queue.ack(&delivery).await {
                    warn!("Failed to ack job {}: {}", delivery.job_id, e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to process job {}: {} (left for redelivery)",
                    delivery.job_id, e
                );
            }
        }
    }

    async fn process(&self, job_id: &str, slot: GlobalSlot) -> Result<JobOutcome, SchedulerError> {
        let Some(cancel_guard) = self.cancellations.claim(job_id) else {
            debug!("Job {} is already executing here, skipping", job_id);
            return Ok(JobOutcome::Skipped);
        };

        let Some(job) = self.store.get(job_id)? else {
            debug!("Job {} no longer exists, skipping", job_id);
            return Ok(JobOutcome::Skipped);
        };

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                // Started but not executing in this process: an earlier
                // delivery failed after the start was recorded
                warn!("Job {} was left processing, recovering", job_id);
                return self
                    .fail_or_retry(&job, interrupted_error(), job.tool_used.clone())
                    .await;
            }
            status => {
                debug!("Job {} is {}, skipping", job_id, status);
                return Ok(JobOutcome::Skipped);
            }
        }

        let Some(owner_slot) = self.slots.try_acquire_owner(&job.owner) else {
            debug!(
                "Owner {} at its concurrency limit, deferring job {}",
                job.owner, job_id
            );
            self.queue
                .enqueue(job_id, self.config.requeue_delay())
                .await?;
            return Ok(JobOutcome::Deferred);
        };
        let _permit = SlotPermit::new(slot, owner_slot);

        // Only one concurrent delivery gets past this point
        let job = match self.store.transition(job_id, JobTransition::Start) {
            Ok(job) => job,
            Err(e) if e.is_state_conflict() => {
                debug!("Job {} was claimed elsewhere: {}", job_id, e);
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Processing job {} ({} -> {}) for {}, attempt {}",
            job.id,
            job.input_format,
            job.output_format,
            job.owner,
            job.attempts + 1
        );

        match self.execute(&job, cancel_guard.token().clone()).await {
            Ok(result) => self.complete(&job, result).await,
            Err((ConverterError::Cancelled, _)) => {
                info!("Job {} cancelled during conversion", job.id);
                Ok(JobOutcome::Skipped)
            }
            Err((error, tool)) => self.fail_or_retry(&job, error, tool).await,
        }
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<ConversionResult, (ConverterError, Option<String>)> {
        let converter = self
            .registry
            .converter_for_pair(&job.input_format, &job.output_format)
            .map_err(|e| (e, None))?;
        let tool = converter.tool().to_string();

        let request = ConversionRequest {
            job_id: job.id.clone(),
            input_path: self.layout.input_path(job),
            output_path: self.layout.output_path(job),
            input_format: job.input_format.clone(),
            output_format: job.output_format.clone(),
            timeout: self.config.process_timeout_duration(),
            cancel: cancel.clone(),
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<ConversionProgress>(PROGRESS_BUFFER);
        let forwarder = {
            let store = Arc::clone(&self.store);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let percent = progress.percent.clamp(0.0, 99.0) as u8;
                    if let Err(e) = store.update(&job_id, JobUpdate::progress(percent)) {
                        debug!("Dropped progress for job {}: {}", job_id, e);
                    }
                }
            })
        };
        let watcher = self.spawn_cancel_watcher(job.id.clone(), cancel);

        let result = converter.execute_with_progress(&request, progress_tx).await;

        watcher.abort();
        let _ = forwarder.await;

        result.map_err(|e| (e, Some(tool)))
    }

    /// Cancellation may be requested from another process sharing the
    /// store; poll the job's status while it runs.
    fn spawn_cancel_watcher(&self, job_id: String, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.poll_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                match store.get(&job_id) {
                    Ok(Some(job)) if job.status != JobStatus::Cancelled => {}
                    Ok(_) => {
                        debug!("Job {} cancelled externally, stopping tool", job_id);
                        token.cancel();
                        return;
                    }
                    Err(e) => debug!("Cancel watcher failed to read job {}: {}", job_id, e),
                }
            }
        })
    }

    async fn complete(&self, job: &Job, result: ConversionResult) -> Result<JobOutcome, SchedulerError> {
        let transition = JobTransition::Complete {
            tool_used: result.tool.clone(),
        };

        match self.store.transition(&job.id, transition) {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => {
                info!(
                    "Job {} was cancelled while converting, discarding output",
                    job.id
                );
                if let Err(e) = tokio::fs::remove_file(&result.output_path).await {
                    warn!("Failed to remove output of job {}: {}", job.id, e);
                }
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        let usage = self
            .accounts
            .get_or_create(&job.owner, self.config.default_quota_bytes)
            .and_then(|_| self.accounts.add_usage(&job.owner, result.output_size_bytes));
        if let Err(e) = usage {
            warn!("Failed to record storage for job {}: {}", job.id, e);
        }

        info!(
            "Job {} completed via {} ({} bytes in {} ms)",
            job.id, result.tool, result.output_size_bytes, result.duration_ms
        );
        Ok(JobOutcome::Completed)
    }

    async fn fail_or_retry(
        &self,
        job: &Job,
        error: ConverterError,
        tool_used: Option<String>,
    ) -> Result<JobOutcome, SchedulerError> {
        let failed_attempts = job.attempts + 1;
        let decision = if error.is_permanent() {
            RetryDecision::GiveUp
        } else {
            self.retry.decide(failed_attempts)
        };
        let message = error.to_string();

        let (transition, outcome) = match decision {
            RetryDecision::Retry => {
                warn!(
                    "Job {} failed (attempt {} of {}): {}, retrying",
                    job.id,
                    failed_attempts,
                    self.retry.max_retries + 1,
                    message
                );
                (
                    JobTransition::Retry {
                        error: message,
                        tool_used,
                    },
                    JobOutcome::Retrying,
                )
            }
            RetryDecision::GiveUp => {
                error!(
                    "Job {} failed after {} attempt(s): {}",
                    job.id, failed_attempts, message
                );
                (
                    JobTransition::Fail {
                        error: message,
                        tool_used,
                    },
                    JobOutcome::Failed,
                )
            }
        };

        match self.store.transition(&job.id, transition) {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => {
                debug!("Job {} changed state before failure was recorded: {}", job.id, e);
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        if outcome == JobOutcome::Retrying {
            self.queue.enqueue(&job.id, Duration::ZERO).await?;
        }

        Ok(outcome)
    }
}
