use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Limits and timings for admission, scheduling and retention.
///
/// Field names match the recognized environment options (`MAX_FILE_SIZE`,
/// `MAX_CONCURRENT_PROCESSES`, ...) lower-cased.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Largest accepted upload in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Global number of execution slots.
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: usize,

    /// Soft cap on jobs in `processing` per owner.
    #[serde(default = "default_max_concurrent_per_user")]
    pub max_concurrent_per_user: usize,

    /// Seconds allowed for one adapter invocation.
    #[serde(default = "default_process_timeout")]
    pub process_timeout: u64,

    /// Failed attempts tolerated before a job is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Days a terminal job is kept before the sweeper removes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Quota given to an owner on first submission.
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,

    /// Delay before a job blocked by the per-owner cap is redelivered.
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,

    /// How often idle workers poll the task queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often the retention sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_max_concurrent_processes() -> usize {
    4
}

fn default_max_concurrent_per_user() -> usize {
    3
}

fn default_process_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_retention_days() -> u32 {
    30
}

fn default_quota_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_requeue_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_concurrent_processes: default_max_concurrent_processes(),
            max_concurrent_per_user: default_max_concurrent_per_user(),
            process_timeout: default_process_timeout(),
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            default_quota_bytes: default_quota_bytes(),
            requeue_delay_ms: default_requeue_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// Sets the global slot count.
    pub fn with_max_concurrent_processes(mut self, max: usize) -> Self {
        self.max_concurrent_processes = max;
        self
    }

    /// Sets the per-owner slot count.
    pub fn with_max_concurrent_per_user(mut self, max: usize) -> Self {
        self.max_concurrent_per_user = max;
        self
    }

    /// Sets the adapter timeout in seconds.
    pub fn with_process_timeout(mut self, secs: u64) -> Self {
        self.process_timeout = secs;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the maximum upload size.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets the worker poll interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the per-owner requeue delay.
    pub fn with_requeue_delay_ms(mut self, ms: u64) -> Self {
        self.requeue_delay_ms = ms;
        self
    }

    pub fn process_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.process_timeout)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Visibility lease for a dequeued task. A delivery that is not acked
    /// within this window is handed out again.
    pub fn queue_lease(&self) -> Duration {
        Duration::from_secs(self.process_timeout + 60)
    }
}

/// On-disk layout for job artifacts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("data/results")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            results_dir: default_results_dir(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("convertd.db")
}

/// Paths to the external conversion tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_imagemagick")]
    pub imagemagick: PathBuf,
    #[serde(default = "default_pandoc")]
    pub pandoc: PathBuf,
    #[serde(default = "default_ebook_convert")]
    pub ebook_convert: PathBuf,
    #[serde(default = "default_tesseract")]
    pub tesseract: PathBuf,
    #[serde(default = "default_zip")]
    pub zip: PathBuf,
    #[serde(default = "default_seven_zip")]
    pub seven_zip: PathBuf,
    #[serde(default = "default_tar")]
    pub tar: PathBuf,
    /// FFmpeg log level. Must stay at `info` or above for progress parsing.
    #[serde(default = "default_ffmpeg_log_level")]
    pub ffmpeg_log_level: String,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_imagemagick() -> PathBuf {
    PathBuf::from("convert")
}

fn default_pandoc() -> PathBuf {
    PathBuf::from("pandoc")
}

fn default_ebook_convert() -> PathBuf {
    PathBuf::from("ebook-convert")
}

fn default_tesseract() -> PathBuf {
    PathBuf::from("tesseract")
}

fn default_zip() -> PathBuf {
    PathBuf::from("zip")
}

fn default_seven_zip() -> PathBuf {
    PathBuf::from("7z")
}

fn default_tar() -> PathBuf {
    PathBuf::from("tar")
}

fn default_ffmpeg_log_level() -> String {
    "info".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            imagemagick: default_imagemagick(),
            pandoc: default_pandoc(),
            ebook_convert: default_ebook_convert(),
            tesseract: default_tesseract(),
            zip: default_zip(),
            seven_zip: default_seven_zip(),
            tar: default_tar(),
            ffmpeg_log_level: default_ffmpeg_log_level(),
        }
    }
}
