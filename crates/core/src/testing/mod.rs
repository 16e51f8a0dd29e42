//! Testing utilities: a scripted converter and fixtures for building a
//! fully in-memory engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use convertd_core::testing::{fixtures, MockConverter};
//!
//! let dir = tempfile::TempDir::new()?;
//! let converter = MockConverter::new();
//! let engine = fixtures::memory_engine(fixtures::config(dir.path()), converter.registry())?;
//! engine.start().await?;
//! ```

mod mock_converter;

pub use mock_converter::{MockConverter, MockOutcome, RecordedConversion};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::account::SqliteAccountStore;
    use crate::config::{Config, DatabaseConfig, EngineConfig, StorageConfig};
    use crate::converter::ConverterRegistry;
    use crate::engine::{Engine, EngineError, Requester};
    use crate::job::{Job, JobStatus, SqliteJobStore};
    use crate::queue::MemoryTaskQueue;

    /// Engine limits with short poll and requeue intervals.
    pub fn engine_config() -> EngineConfig {
        EngineConfig::default()
            .with_poll_interval_ms(10)
            .with_requeue_delay_ms(20)
            .with_process_timeout(5)
    }

    /// Configuration rooted in `root`.
    pub fn config(root: &Path) -> Config {
        Config {
            engine: engine_config(),
            storage: StorageConfig {
                upload_dir: root.join("uploads"),
                results_dir: root.join("results"),
            },
            database: DatabaseConfig {
                path: root.join("convertd.db"),
            },
            ..Config::default()
        }
    }

    /// An engine on in-memory stores and an in-memory queue.
    pub fn memory_engine(config: Config, registry: ConverterRegistry) -> Result<Engine, EngineError> {
        let lease = config.engine.queue_lease();
        Ok(Engine::new(
            config,
            Arc::new(SqliteJobStore::in_memory()?),
            Arc::new(SqliteAccountStore::in_memory()?),
            Arc::new(MemoryTaskQueue::new(lease)),
            registry,
        ))
    }

    /// Write an "uploaded" file of `size` bytes into `dir`.
    pub async fn write_upload(dir: &Path, name: &str, size: usize) -> std::io::Result<PathBuf> {
        let path = dir.join(name);
        tokio::fs::write(&path, vec![b'x'; size]).await?;
        Ok(path)
    }

    /// Poll until the job reaches one of `statuses` or `timeout` passes.
    pub async fn wait_for_status(
        engine: &Engine,
        job_id: &str,
        statuses: &[JobStatus],
        timeout: Duration,
    ) -> Option<Job> {
        let admin = Requester::admin("fixtures");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(job) = engine.get_status(job_id, &admin) {
                if statuses.contains(&job.status) {
                    return Some(job);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until the job is terminal.
    pub async fn wait_for_terminal(engine: &Engine, job_id: &str, timeout: Duration) -> Option<Job> {
        wait_for_status(
            engine,
            job_id,
            &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled],
            timeout,
        )
        .await
    }
}
