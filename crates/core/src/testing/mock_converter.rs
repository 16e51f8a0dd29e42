//! Mock converter for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

use crate::converter::{
    AdapterFamily, ConversionProgress, ConversionRequest, ConversionResult, Converter,
    ConverterError, ConverterRegistry,
};

/// What the next execution should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Write the output and succeed.
    Succeed,
    /// Fail as if the tool exited with this code.
    Fail { code: Option<i32> },
    /// Fail with a timeout error right away.
    Timeout,
    /// Run until cancelled or until the request's timeout elapses.
    Hang,
}

/// A recorded execution for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedConversion {
    pub job_id: String,
    pub family: AdapterFamily,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub success: bool,
}

#[derive(Debug)]
struct Shared {
    conversions: RwLock<Vec<RecordedConversion>>,
    /// Consumed front to back; `Succeed` once empty.
    outcomes: RwLock<VecDeque<MockOutcome>>,
    conversion_duration_ms: RwLock<u64>,
    send_progress: RwLock<bool>,
    output_bytes: RwLock<Vec<u8>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// Mock implementation of the Converter trait.
///
/// Clones made with [`MockConverter::for_family`] share scripted outcomes,
/// recordings and concurrency counters, so a single handle observes every
/// family bound in a registry.
///
/// # Example
///
/// ```rust,ignore
/// use convertd_core::testing::{MockConverter, MockOutcome};
///
/// let converter = MockConverter::new();
/// converter.push_outcome(MockOutcome::Fail { code: Some(1) }).await;
/// let registry = converter.registry();
///
/// // ... run jobs ...
///
/// assert_eq!(converter.conversion_count().await, 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockConverter {
    family: AdapterFamily,
    tool: String,
    shared: Arc<Shared>,
}

impl Default for MockConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConverter {
    pub fn new() -> Self {
        let shared = Shared {
            conversions: RwLock::new(Vec::new()),
            outcomes: RwLock::new(VecDeque::new()),
            conversion_duration_ms: RwLock::new(0),
            send_progress: RwLock::new(false),
            output_bytes: RwLock::new(b"converted".to_vec()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        };
        Self::with_shared(AdapterFamily::Document, Arc::new(shared))
    }

    fn with_shared(family: AdapterFamily, shared: Arc<Shared>) -> Self {
        Self {
            family,
            tool: format!("mock-{}", family),
            shared,
        }
    }

    /// A handle serving `family` that shares this mock's state.
    pub fn for_family(&self, family: AdapterFamily) -> Self {
        Self::with_shared(family, Arc::clone(&self.shared))
    }

    /// A registry with every family bound to this mock.
    pub fn registry(&self) -> ConverterRegistry {
        AdapterFamily::ALL
            .iter()
            .fold(ConverterRegistry::new(), |registry, family| {
                registry.with_converter(Arc::new(self.for_family(*family)))
            })
    }

    /// Queue the outcome of a future execution.
    pub async fn push_outcome(&self, outcome: MockOutcome) {
        self.shared.outcomes.write().await.push_back(outcome);
    }

    /// Queue `count` failures.
    pub async fn fail_times(&self, count: usize) {
        let mut outcomes = self.shared.outcomes.write().await;
        for _ in 0..count {
            outcomes.push_back(MockOutcome::Fail { code: Some(1) });
        }
    }

    /// Set the simulated conversion duration.
    pub async fn set_conversion_duration(&self, duration: Duration) {
        *self.shared.conversion_duration_ms.write().await = duration.as_millis() as u64;
    }

    /// Enable or disable progress updates during conversion.
    pub async fn set_send_progress(&self, send: bool) {
        *self.shared.send_progress.write().await = send;
    }

    /// Bytes written to the output on success.
    pub async fn set_output_bytes(&self, bytes: impl Into<Vec<u8>>) {
        *self.shared.output_bytes.write().await = bytes.into();
    }

    pub async fn recorded_conversions(&self) -> Vec<RecordedConversion> {
        self.shared.conversions.read().await.clone()
    }

    pub async fn conversion_count(&self) -> usize {
        self.shared.conversions.read().await.len()
    }

    /// Executions recorded for one job.
    pub async fn conversions_for(&self, job_id: &str) -> Vec<RecordedConversion> {
        self.shared
            .conversions
            .read()
            .await
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Executions in flight right now.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Highest number of executions observed in flight at once.
    pub fn max_running(&self) -> usize {
        self.shared.max_running.load(Ordering::SeqCst)
    }

    async fn next_outcome(&self) -> MockOutcome {
        self.shared
            .outcomes
            .write()
            .await
            .pop_front()
            .unwrap_or(MockOutcome::Succeed)
    }

    async fn record(&self, request: &ConversionRequest, success: bool) {
        self.shared.conversions.write().await.push(RecordedConversion {
            job_id: request.job_id.clone(),
            family: self.family,
            input_path: request.input_path.clone(),
            output_path: request.output_path.clone(),
            success,
        });
    }

    /// Sleep for the configured duration, emitting progress if enabled.
    async fn simulate_work(
        &self,
        request: &ConversionRequest,
        progress_tx: Option<&mpsc::Sender<ConversionProgress>>,
    ) -> Result<(), ConverterError> {
        let duration_ms = *self.shared.conversion_duration_ms.read().await;
        let send_progress = *self.shared.send_progress.read().await;
        let steps: u64 = 4;

        for step in 1..=steps {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(ConverterError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(duration_ms / steps)) => {}
            }

            if let (true, Some(tx)) = (send_progress, progress_tx) {
                let _ = tx
                    .send(ConversionProgress {
                        job_id: request.job_id.clone(),
                        percent: step as f32 / steps as f32 * 100.0,
                        time_secs: (step * duration_ms / steps) as f64 / 1000.0,
                        duration_secs: Some(duration_ms as f64 / 1000.0),
                        speed: Some("1x".to_string()),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        progress_tx: Option<&mpsc::Sender<ConversionProgress>>,
    ) -> Result<ConversionResult, ConverterError> {
        let started = Instant::now();
        if !request.input_path.exists() {
            return Err(ConverterError::InputNotFound {
                path: request.input_path.clone(),
            });
        }

        self.simulate_work(request, progress_tx).await?;

        match self.next_outcome().await {
            MockOutcome::Succeed => {}
            MockOutcome::Fail { code } => {
                return Err(ConverterError::execution_failed(
                    &self.tool,
                    code,
                    "simulated failure".to_string(),
                ));
            }
            MockOutcome::Timeout => {
                return Err(ConverterError::Timeout {
                    timeout_secs: request.timeout_secs(),
                });
            }
            MockOutcome::Hang => {
                return tokio::select! {
                    _ = request.cancel.cancelled() => Err(ConverterError::Cancelled),
                    _ = tokio::time::sleep(request.timeout) => Err(ConverterError::Timeout {
                        timeout_secs: request.timeout_secs(),
                    }),
                };
            }
        }

        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = self.shared.output_bytes.read().await.clone();
        tokio::fs::write(&request.output_path, &bytes).await?;

        Ok(ConversionResult {
            job_id: request.job_id.clone(),
            output_path: request.output_path.clone(),
            output_size_bytes: bytes.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            tool: self.tool.clone(),
        })
    }

    async fn tracked(
        &self,
        request: &ConversionRequest,
        progress_tx: Option<&mpsc::Sender<ConversionProgress>>,
    ) -> Result<ConversionResult, ConverterError> {
        let now = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_running.fetch_max(now, Ordering::SeqCst);

        let result = self.run(request, progress_tx).await;

        self.shared.running.fetch_sub(1, Ordering::SeqCst);
        self.record(request, result.is_ok()).await;
        result
    }
}

#[async_trait]
impl Converter for MockConverter {
    fn family(&self) -> AdapterFamily {
        self.family
    }

    fn tool(&self) -> &str {
        &self.tool
    }

    async fn execute(&self, request: &ConversionRequest) -> Result<ConversionResult, ConverterError> {
        self.tracked(request, None).await
    }

    async fn execute_with_progress(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
    ) -> Result<ConversionResult, ConverterError> {
        self.tracked(request, Some(&progress_tx)).await
    }

    async fn validate(&self) -> Result<(), ConverterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn create_request(dir: &TempDir, id: &str) -> ConversionRequest {
        let input_path = dir.path().join(format!("{}.md", id));
        std::fs::write(&input_path, "# title").unwrap();
        ConversionRequest {
            job_id: id.to_string(),
            input_path,
            output_path: dir.path().join("out").join(format!("{}.html", id)),
            input_format: "md".to_string(),
            output_format: "html".to_string(),
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_basic_conversion() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();

        let result = converter.execute(&create_request(&dir, "job-1")).await.unwrap();

        assert_eq!(result.tool, "mock-document");
        assert_eq!(result.output_size_bytes, 9);
        assert!(result.output_path.exists());
    }

    #[tokio::test]
    async fn test_scripted_outcomes_are_consumed_in_order() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        converter.fail_times(1).await;
        converter.push_outcome(MockOutcome::Timeout).await;
        let request = create_request(&dir, "job-1");

        let err = converter.execute(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "tool exited with error");

        let err = converter.execute(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "timed out after 5s");

        assert!(converter.execute(&request).await.is_ok());

        let recorded = converter.conversions_for("job-1").await;
        assert_eq!(recorded.len(), 3);
        assert!(!recorded[0].success);
        assert!(recorded[2].success);
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        converter.push_outcome(MockOutcome::Hang).await;
        let request = create_request(&dir, "job-1");
        let cancel = request.cancel.clone();

        let task = {
            let converter = converter.clone();
            tokio::spawn(async move { converter.execute(&request).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(converter.running(), 1);
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ConverterError::Cancelled));
        assert_eq!(converter.running(), 0);
    }

    #[tokio::test]
    async fn test_family_handles_share_state() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let ocr = converter.for_family(AdapterFamily::Ocr);

        let result = ocr.execute(&create_request(&dir, "job-1")).await.unwrap();

        assert_eq!(result.tool, "mock-ocr");
        let recorded = converter.recorded_conversions().await;
        assert_eq!(recorded[0].family, AdapterFamily::Ocr);
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        converter.set_send_progress(true).await;
        converter.set_conversion_duration(Duration::from_millis(40)).await;

        let (tx, mut rx) = mpsc::channel(10);
        let request = create_request(&dir, "progress-test");
        tokio::spawn(async move {
            converter.execute_with_progress(&request, tx).await.unwrap();
        });

        let mut progress_count = 0;
        while rx.recv().await.is_some() {
            progress_count += 1;
        }
        assert_eq!(progress_count, 4);
    }
}
