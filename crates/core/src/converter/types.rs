//! Request and result types for the converter module.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// One execution of a converter.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Normalised input format.
    pub input_format: String,
    /// Normalised output format.
    pub output_format: String,
    /// Hard upper bound on the tool's runtime.
    pub timeout: Duration,
    /// Cancelling this token kills the running tool.
    pub cancel: CancellationToken,
}

impl ConversionRequest {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }
}

/// Outcome of a successful conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub job_id: String,
    pub output_path: PathBuf,
    pub output_size_bytes: u64,
    pub duration_ms: u64,
    /// Name of the tool that produced the output.
    pub tool: String,
}

/// Progress update emitted while a conversion runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProgress {
    pub job_id: String,
    /// 0.0 - 100.0
    pub percent: f32,
    /// Position reached in the input, in seconds.
    pub time_secs: f64,
    /// Total input duration if the tool reported it.
    pub duration_secs: Option<f64>,
    /// Processing speed (e.g. "1.5x").
    pub speed: Option<String>,
}
