//! The engine facade: the operations exposed to an API or CLI layer.
//!
//! # Example
//!
//! ```ignore
//! use convertd_core::{config::load_config, engine::{Engine, Requester}};
//! use convertd_core::admission::SubmitRequest;
//!
//! let engine = Engine::open(load_config(Path::new("convertd.toml"))?)?;
//! engine.start().await?;
//!
//! let request = SubmitRequest::for_file("alice", "/tmp/scan.png", "pdf").await?;
//! let job = engine.submit(request).await?.job;
//!
//! let status = engine.get_status(&job.id, &Requester::user("alice"))?;
//! engine.cancel(&job.id, &Requester::admin("ops"))?;
//! engine.stop().await;
//! ```

mod requester;

pub use requester::Requester;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::account::{AccountError, AccountStore, SqliteAccountStore, StorageAccount};
use crate::admission::{Admission, AdmissionController, AdmissionError, SubmitRequest, Submission};
use crate::config::Config;
use crate::converter::{AdapterFamily, ConverterError, ConverterRegistry, FormatSupport};
use crate::job::{Job, JobError, JobFilter, JobStore, JobTransition, SqliteJobStore};
use crate::queue::{QueueError, SqliteTaskQueue, TaskQueue};
use crate::scheduler::{JobOutcome, PoolStatus, SchedulerError, WorkerPool};
use crate::storage::{ArtifactLayout, StorageError};
use crate::sweeper::{RetentionSweeper, SweepError, SweepReport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("not allowed to access job {0}")]
    Forbidden(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Wires admission, the worker pool and the sweeper around shared stores.
pub struct Engine {
    config: Config,
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStore>,
    registry: ConverterRegistry,
    layout: ArtifactLayout,
    admission: AdmissionController,
    pool: WorkerPool,
    sweeper: Arc<RetentionSweeper>,
    shutdown_tx: broadcast::Sender<()>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStore>,
        queue: Arc<dyn TaskQueue>,
        registry: ConverterRegistry,
    ) -> Self {
        let layout = ArtifactLayout::from_config(&config.storage);
        let pool = WorkerPool::new(
            config.engine.clone(),
            Arc::clone(&store),
            Arc::clone(&accounts),
            Arc::clone(&queue),
            registry.clone(),
            layout.clone(),
        );
        let admission = AdmissionController::new(
            config.engine.clone(),
            registry.clone(),
            Arc::clone(&store),
            Arc::clone(&accounts),
            queue,
            layout.clone(),
            pool.slots().clone(),
        );
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            layout.clone(),
            config.engine.retention(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            accounts,
            registry,
            layout,
            admission,
            pool,
            sweeper,
            shutdown_tx,
            sweeper_task: Mutex::new(None),
        }
    }

    /// Engine backed by the SQLite database and tools named in `config`.
    pub fn open(config: Config) -> Result<Self, EngineError> {
        let path = config.database.path.clone();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&path)?);
        let accounts: Arc<dyn AccountStore> = Arc::new(SqliteAccountStore::new(&path)?);
        let queue: Arc<dyn TaskQueue> =
            Arc::new(SqliteTaskQueue::new(&path, config.engine.queue_lease())?);
        let registry = ConverterRegistry::from_tools(&config.tools);
        Ok(Self::new(config, store, accounts, queue, registry))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Start the worker pool and the periodic retention sweep.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.layout.ensure_roots().await?;
        self.pool.start().await;

        let mut task = self.sweeper_task.lock().await;
        if task.is_none() {
            *task = Some(Arc::clone(&self.sweeper).spawn(
                self.config.engine.sweep_interval(),
                self.shutdown_tx.subscribe(),
            ));
        }
        Ok(())
    }

    /// Stop background work, waiting for running conversions to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.sweeper_task.lock().await.take() {
            let _ = task.await;
        }
        self.pool.stop().await;
        info!("Engine stopped");
    }

    pub fn admit(&self, request: &SubmitRequest) -> Result<Admission, EngineError> {
        Ok(self.admission.admit(request)?)
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, EngineError> {
        Ok(self.admission.submit(request).await?)
    }

    /// Cancel a pending or processing job. Only its owner or an admin may.
    pub fn cancel(&self, job_id: &str, requester: &Requester) -> Result<Job, EngineError> {
        self.get_status(job_id, requester)?;

        let job = self.store.transition(job_id, JobTransition::Cancel)?;
        let interrupted = self.pool.cancellations().cancel(job_id);
        info!(
            "Job {} cancelled by {}{}",
            job_id,
            requester.user_id,
            if interrupted { ", stopping its conversion" } else { "" }
        );
        Ok(job)
    }

    pub fn get_status(&self, job_id: &str, requester: &Requester) -> Result<Job, EngineError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if !requester.can_access(&job) {
            return Err(EngineError::Forbidden(job_id.to_string()));
        }
        Ok(job)
    }

    /// Jobs visible to the requester: their own, or all for admins.
    pub fn list_jobs(&self, requester: &Requester, filter: JobFilter) -> Result<Vec<Job>, EngineError> {
        let filter = requester.scope(filter);
        Ok(self.store.list(&filter)?)
    }

    pub fn account(&self, owner: &str) -> Result<Option<StorageAccount>, EngineError> {
        Ok(self.accounts.get(owner)?)
    }

    pub fn set_quota(&self, owner: &str, quota_bytes: u64) -> Result<StorageAccount, EngineError> {
        self.accounts
            .get_or_create(owner, self.config.engine.default_quota_bytes)?;
        Ok(self.accounts.set_quota(owner, quota_bytes)?)
    }

    /// Run one job in the foreground, bypassing the dispatcher.
    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome, EngineError> {
        Ok(self.pool.process_job(job_id).await?)
    }

    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        Ok(self.sweeper.sweep().await?)
    }

    pub async fn pool_status(&self) -> PoolStatus {
        self.pool.status().await
    }

    pub fn supported_formats(&self) -> Vec<FormatSupport> {
        self.registry.supported_formats()
    }

    pub async fn check_tools(&self) -> Vec<(AdapterFamily, Result<(), ConverterError>)> {
        self.registry.validate_all().await
    }
}
