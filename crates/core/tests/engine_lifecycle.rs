//! Engine lifecycle integration tests.
//!
//! These tests drive the engine end to end with a scripted converter:
//! - Job state transitions (pending -> processing -> completed / failed)
//! - Global and per-owner concurrency limits
//! - Admission rejections and deferral
//! - Retry, timeout and cancellation handling
//! - Redelivery idempotency and startup recovery
//! - Retention sweeping

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use convertd_core::{
    account::SqliteAccountStore,
    admission::{Admission, AdmissionError, SubmitRequest},
    config::{Config, EngineConfig},
    engine::{Engine, EngineError, Requester},
    job::{Job, JobError, JobFilter, JobStatus, JobStore, JobTransition, SqliteJobStore},
    queue::{MemoryTaskQueue, TaskQueue},
    testing::{fixtures, MockConverter, MockOutcome},
};

const WAIT: Duration = Duration::from_secs(5);

/// Test helper holding the engine and handles on its collaborators.
struct TestHarness {
    engine: Engine,
    converter: MockConverter,
    store: Arc<SqliteJobStore>,
    queue: Arc<MemoryTaskQueue>,
    temp_dir: TempDir,
    source_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(fixtures::engine_config())
    }

    fn with_config(engine_config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let source_dir = TempDir::new().expect("Failed to create source dir");

        let config = Config {
            engine: engine_config,
            ..fixtures::config(temp_dir.path())
        };

        let store = Arc::new(SqliteJobStore::in_memory().expect("Failed to create job store"));
        let accounts =
            Arc::new(SqliteAccountStore::in_memory().expect("Failed to create account store"));
        let queue = Arc::new(MemoryTaskQueue::new(config.engine.queue_lease()));
        let converter = MockConverter::new();

        let engine = Engine::new(
            config,
            Arc::clone(&store) as Arc<dyn JobStore>,
            accounts,
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            converter.registry(),
        );

        Self {
            engine,
            converter,
            store,
            queue,
            temp_dir,
            source_dir,
        }
    }

    async fn upload(&self, name: &str, size: usize) -> PathBuf {
        fixtures::write_upload(self.source_dir.path(), name, size)
            .await
            .expect("Failed to write upload")
    }

    async fn submit(&self, owner: &str, name: &str, to: &str) -> Job {
        self.try_submit(owner, name, 64, to)
            .await
            .expect("Submission rejected")
    }

    async fn try_submit(
        &self,
        owner: &str,
        name: &str,
        size: usize,
        to: &str,
    ) -> Result<Job, EngineError> {
        let path = self.upload(name, size).await;
        let request = SubmitRequest::for_file(owner, &path, to)
            .await
            .expect("Failed to stat upload");
        self.engine.submit(request).await.map(|s| s.job)
    }

    async fn wait_terminal(&self, job_id: &str) -> Job {
        fixtures::wait_for_terminal(&self.engine, job_id, WAIT)
            .await
            .expect("Job did not reach a terminal state")
    }

    async fn wait_status(&self, job_id: &str, status: JobStatus) -> Job {
        fixtures::wait_for_status(&self.engine, job_id, &[status], WAIT)
            .await
            .unwrap_or_else(|| panic!("Job {} never reached {}", job_id, status))
    }

    async fn wait_queue_drained(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.queue.is_empty().await.unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "Queue never drained");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn all_jobs(&self) -> Vec<Job> {
        self.engine
            .list_jobs(&Requester::admin("test"), JobFilter::new())
            .unwrap()
    }

    fn results_dir(&self) -> PathBuf {
        self.temp_dir.path().join("results")
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_job_completes() {
    let harness = TestHarness::new();
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.output_filename, "notes.pdf");

    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.tool_used.as_deref(), Some("mock-document"));
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());

    let output = harness.results_dir().join(&job.id).join("notes.pdf");
    assert_eq!(tokio::fs::read(&output).await.unwrap(), b"converted");

    let account = harness.engine.account("alice").unwrap().unwrap();
    assert_eq!(account.used_bytes, 9);

    harness.engine.stop().await;
    let status = harness.engine.pool_status().await;
    assert!(!status.running);
    assert_eq!(status.total_processed, 1);
}

#[tokio::test]
async fn test_progress_is_reported_while_processing() {
    let harness = TestHarness::new();
    harness.converter.set_send_progress(true).await;
    harness
        .converter
        .set_conversion_duration(Duration::from_millis(200))
        .await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "track.flac", "mp3").await;
    harness.wait_status(&job.id, JobStatus::Processing).await;

    let mut seen = Vec::new();
    loop {
        let current = harness
            .engine
            .get_status(&job.id, &Requester::user("alice"))
            .unwrap();
        if current.status != JobStatus::Processing {
            break;
        }
        seen.push(current.progress);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(seen.iter().any(|p| *p > 0));
    assert!(seen.iter().all(|p| *p < 100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.tool_used.as_deref(), Some("mock-audio"));
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_ocr_routing_takes_priority_over_image() {
    let harness = TestHarness::new();
    harness.engine.start().await.unwrap();

    let scan = harness.submit("alice", "scan.png", "pdf").await;
    let resize = harness.submit("alice", "photo.png", "jpg").await;

    let scan = harness.wait_terminal(&scan.id).await;
    let resize = harness.wait_terminal(&resize.id).await;

    assert_eq!(scan.tool_used.as_deref(), Some("mock-ocr"));
    assert_eq!(resize.tool_used.as_deref(), Some("mock-image"));
    harness.engine.stop().await;
}

// =============================================================================
// Concurrency limits
// =============================================================================

#[tokio::test]
async fn test_global_concurrency_cap() {
    let harness = TestHarness::with_config(
        fixtures::engine_config()
            .with_max_concurrent_processes(2)
            .with_max_concurrent_per_user(2),
    );
    harness
        .converter
        .set_conversion_duration(Duration::from_millis(300))
        .await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = harness
            .submit(&format!("user-{}", i), &format!("doc-{}.md", i), "pdf")
            .await;
        ids.push(job.id);
    }

    harness.engine.start().await.unwrap();

    let admin = Requester::admin("test");
    let count = |status| {
        harness
            .engine
            .list_jobs(&admin, JobFilter::new().with_status(status))
            .unwrap()
            .len()
    };
    let deadline = tokio::time::Instant::now() + WAIT;
    while count(JobStatus::Processing) < 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(count(JobStatus::Pending), 3);
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Completed);
    }

    assert_eq!(harness.converter.max_running(), 2);
    assert_eq!(harness.converter.conversion_count().await, 5);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_per_owner_concurrency_cap() {
    let harness = TestHarness::with_config(
        fixtures::engine_config()
            .with_max_concurrent_processes(4)
            .with_max_concurrent_per_user(1),
    );
    harness
        .converter
        .set_conversion_duration(Duration::from_millis(50))
        .await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(harness.submit("alice", &format!("doc-{}.md", i), "pdf").await.id);
    }

    harness.engine.start().await.unwrap();
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Completed);
    }

    assert_eq!(harness.converter.max_running(), 1);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_busy_engine_defers_instead_of_rejecting() {
    let harness = TestHarness::with_config(
        fixtures::engine_config().with_max_concurrent_processes(1),
    );
    harness.converter.push_outcome(MockOutcome::Hang).await;
    harness.engine.start().await.unwrap();

    let first = harness.submit("alice", "long.md", "pdf").await;
    harness.wait_status(&first.id, JobStatus::Processing).await;

    let path = harness.upload("second.md", 64).await;
    let request = SubmitRequest::for_file("bob", &path, "pdf").await.unwrap();
    let submission = harness.engine.submit(request).await.unwrap();
    assert_eq!(submission.admission, Admission::Deferred { processing: 1 });
    assert_eq!(submission.job.status, JobStatus::Pending);

    harness
        .engine
        .cancel(&first.id, &Requester::user("alice"))
        .unwrap();

    let second = harness.wait_terminal(&submission.job.id).await;
    assert_eq!(second.status, JobStatus::Completed);
    harness.engine.stop().await;
}

// =============================================================================
// Admission rejections
// =============================================================================

#[tokio::test]
async fn test_oversize_upload_leaves_no_job() {
    let harness = TestHarness::with_config(fixtures::engine_config().with_max_file_size(100));

    let err = harness
        .try_submit("alice", "big.md", 101, "pdf")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Admission(AdmissionError::FileTooLarge { size: 101, max: 100 })
    ));
    assert!(harness.all_jobs().is_empty());
    assert!(harness.queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_quota_exceeded_leaves_no_job() {
    let harness = TestHarness::new();
    harness.engine.set_quota("alice", 100).unwrap();

    let err = harness
        .try_submit("alice", "report.md", 150, "pdf")
        .await
        .unwrap_err();

    match err {
        EngineError::Admission(AdmissionError::QuotaExceeded {
            used, quota, requested, ..
        }) => {
            assert_eq!((used, quota, requested), (0, 100, 150));
        }
        other => panic!("Expected QuotaExceeded, got {:?}", other),
    }
    assert!(harness.all_jobs().is_empty());
    assert!(harness.source_dir.path().join("report.md").exists());
}

#[tokio::test]
async fn test_unroutable_pair_is_rejected() {
    let harness = TestHarness::new();

    let err = harness
        .try_submit("alice", "data.xyz", 10, "pdf")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Admission(AdmissionError::Validation { .. })
    ));
    assert!(harness.all_jobs().is_empty());
}

// =============================================================================
// Retries and failures
// =============================================================================

#[tokio::test]
async fn test_transient_failures_then_success() {
    let harness = TestHarness::with_config(fixtures::engine_config().with_max_retries(2));
    harness.converter.fail_times(2).await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    let job = harness.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert!(job.error_message.is_none());
    assert_eq!(harness.converter.conversions_for(&job.id).await.len(), 3);

    harness.engine.stop().await;
    assert_eq!(harness.engine.pool_status().await.total_retried, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let harness = TestHarness::with_config(fixtures::engine_config().with_max_retries(2));
    harness.converter.fail_times(3).await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    let job = harness.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("tool exited with error"));
    assert_eq!(job.tool_used.as_deref(), Some("mock-document"));
    assert!(job.completed_at.is_some());
    assert!(!harness.results_dir().join(&job.id).join("notes.pdf").exists());

    let account = harness.engine.account("alice").unwrap().unwrap();
    assert_eq!(account.used_bytes, 0);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_timeout_message_after_retries() {
    let harness = TestHarness::with_config(fixtures::engine_config().with_max_retries(1));
    harness.converter.push_outcome(MockOutcome::Timeout).await;
    harness.converter.push_outcome(MockOutcome::Timeout).await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "clip.mp4", "webm").await;
    let job = harness.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error_message.as_deref(), Some("timed out after 5s"));
    harness.engine.stop().await;
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() {
    let harness = TestHarness::new();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    let cancelled = harness
        .engine
        .cancel(&job.id, &Requester::user("alice"))
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    harness.engine.start().await.unwrap();
    harness.wait_queue_drained().await;

    let job = harness
        .engine
        .get_status(&job.id, &Requester::user("alice"))
        .unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(harness.converter.conversion_count().await, 0);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_cancel_stops_running_conversion() {
    let harness = TestHarness::new();
    harness.converter.push_outcome(MockOutcome::Hang).await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    harness.wait_status(&job.id, JobStatus::Processing).await;

    harness
        .engine
        .cancel(&job.id, &Requester::admin("ops"))
        .unwrap();
    harness.wait_queue_drained().await;

    assert_eq!(harness.converter.running(), 0);
    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!harness.results_dir().join(&job.id).join("notes.pdf").exists());
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_cancel_through_shared_store_stops_conversion() {
    let harness = TestHarness::new();
    harness.converter.push_outcome(MockOutcome::Hang).await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    harness.wait_status(&job.id, JobStatus::Processing).await;

    // Another process cancels by writing to the store; the in-process
    // token is never touched directly
    harness.store.transition(&job.id, JobTransition::Cancel).unwrap();
    harness.wait_queue_drained().await;

    assert_eq!(harness.converter.running(), 0);
    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempts, 0);
    assert!(!harness.results_dir().join(&job.id).join("notes.pdf").exists());

    let runs = harness.converter.conversions_for(&job.id).await;
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].success);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_cancel_requires_owner_or_admin() {
    let harness = TestHarness::new();
    let job = harness.submit("alice", "notes.md", "pdf").await;

    let err = harness
        .engine
        .cancel(&job.id, &Requester::user("mallory"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = harness
        .engine
        .cancel("missing", &Requester::admin("ops"))
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    harness
        .engine
        .cancel(&job.id, &Requester::user("alice"))
        .unwrap();
    let err = harness
        .engine
        .cancel(&job.id, &Requester::user("alice"))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Job(JobError::InvalidTransition {
            from: JobStatus::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_list_jobs_is_scoped_to_requester() {
    let harness = TestHarness::new();
    harness.submit("alice", "a.md", "pdf").await;
    harness.submit("bob", "b.md", "pdf").await;

    let mine = harness
        .engine
        .list_jobs(&Requester::user("alice"), JobFilter::new())
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].owner, "alice");

    assert_eq!(harness.all_jobs().len(), 2);

    let err = harness
        .engine
        .get_status(&mine[0].id, &Requester::user("bob"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
}

// =============================================================================
// Delivery semantics
// =============================================================================

#[tokio::test]
async fn test_redelivered_job_runs_once() {
    let harness = TestHarness::new();
    let job = harness.submit("alice", "notes.md", "pdf").await;

    // A second copy of the task, as after a lost ack
    harness.queue.enqueue(&job.id, Duration::ZERO).await.unwrap();
    assert_eq!(harness.queue.job_ids(), vec![job.id.clone(), job.id.clone()]);

    harness.engine.start().await.unwrap();
    harness.wait_queue_drained().await;

    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.converter.conversions_for(&job.id).await.len(), 1);
    assert_eq!(harness.engine.account("alice").unwrap().unwrap().used_bytes, 9);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_redelivery_during_execution_runs_once() {
    let harness = TestHarness::new();
    harness
        .converter
        .set_conversion_duration(Duration::from_millis(300))
        .await;
    harness.engine.start().await.unwrap();

    let job = harness.submit("alice", "notes.md", "pdf").await;
    harness.wait_status(&job.id, JobStatus::Processing).await;

    // The in-flight task's lease lapses while the conversion still runs
    assert_eq!(harness.queue.redeliver(), 1);
    harness.wait_queue_drained().await;

    let job = harness.wait_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);
    assert_eq!(harness.converter.max_running(), 1);
    assert_eq!(harness.converter.conversions_for(&job.id).await.len(), 1);
    assert_eq!(harness.engine.account("alice").unwrap().unwrap().used_bytes, 9);
    harness.engine.stop().await;
}

#[tokio::test]
async fn test_interrupted_job_is_recovered_on_start() {
    let harness = TestHarness::new();
    let job = harness.submit("alice", "notes.md", "pdf").await;

    // Simulate a crash mid-conversion: the job was started but never finished
    harness.store.transition(&job.id, JobTransition::Start).unwrap();

    harness.engine.start().await.unwrap();
    let job = harness.wait_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    harness.engine.stop().await;
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn test_sweep_removes_expired_jobs_once() {
    let mut config = fixtures::engine_config();
    config.retention_days = 0;
    let harness = TestHarness::with_config(config);
    harness.engine.start().await.unwrap();

    let done = harness.submit("alice", "notes.md", "pdf").await;
    harness.wait_terminal(&done.id).await;
    harness.engine.stop().await;

    let pending = harness.submit("alice", "later.md", "pdf").await;
    let uploads = harness.temp_dir.path().join("uploads");
    assert!(uploads.join(&done.id).exists());

    let report = harness.engine.sweep().await.unwrap();
    assert_eq!(report.jobs_removed, 1);
    assert_eq!(report.dirs_removed, 2);
    assert!(!uploads.join(&done.id).exists());
    assert!(!harness.results_dir().join(&done.id).exists());

    let admin = Requester::admin("ops");
    assert!(matches!(
        harness.engine.get_status(&done.id, &admin),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(
        harness.engine.get_status(&pending.id, &admin).unwrap().status,
        JobStatus::Pending
    );

    let report = harness.engine.sweep().await.unwrap();
    assert_eq!(report.jobs_removed, 0);
    assert_eq!(report.dirs_removed, 0);
}
