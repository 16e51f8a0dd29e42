//! External-process converter shared by every adapter family.

use async_trait::async_trait;
use regex_lite::Regex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::error::ConverterError;
use super::family::AdapterFamily;
use super::traits::Converter;
use super::types::{ConversionProgress, ConversionRequest, ConversionResult};
use crate::config::ToolsConfig;

/// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Runs the external tool for one adapter family.
pub struct ToolConverter {
    family: AdapterFamily,
    tools: ToolsConfig,
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    program: PathBuf,
    args: Vec<String>,
}

enum RunOutcome {
    Exited(ExitStatus, String),
    Io(io::Error),
    TimedOut,
    Cancelled,
}

impl ToolConverter {
    pub fn new(family: AdapterFamily, tools: ToolsConfig) -> Self {
        Self { family, tools }
    }

    /// Tool name recorded for a family.
    pub fn tool_name(family: AdapterFamily) -> &'static str {
        match family {
            AdapterFamily::Audio | AdapterFamily::Video => "ffmpeg",
            AdapterFamily::Image => "imagemagick",
            AdapterFamily::Document => "pandoc",
            AdapterFamily::Ebook => "calibre",
            AdapterFamily::Archive => "archive-tools",
            AdapterFamily::Ocr => "tesseract",
        }
    }

    /// Binaries this family needs, with the argument used to probe each.
    fn programs(&self) -> Vec<(&Path, &'static str)> {
        match self.family {
            AdapterFamily::Audio | AdapterFamily::Video => vec![(self.tools.ffmpeg.as_path(), "-version")],
            AdapterFamily::Image => vec![(self.tools.imagemagick.as_path(), "-version")],
            AdapterFamily::Document => vec![(self.tools.pandoc.as_path(), "--version")],
            AdapterFamily::Ebook => vec![(self.tools.ebook_convert.as_path(), "--version")],
            AdapterFamily::Archive => vec![
                (self.tools.zip.as_path(), "-v"),
                (self.tools.seven_zip.as_path(), "i"),
                (self.tools.tar.as_path(), "--version"),
            ],
            AdapterFamily::Ocr => vec![(self.tools.tesseract.as_path(), "--version")],
        }
    }

    fn build_invocation(&self, request: &ConversionRequest, output: &Path) -> Invocation {
        let input = path_arg(&request.input_path);
        let out = path_arg(output);
        let format = request.output_format.as_str();

        match self.family {
            AdapterFamily::Audio => {
                let mut args = vec!["-y".to_string(), "-i".to_string(), input, "-vn".to_string()];
                args.extend(["-c:a".to_string(), audio_codec(format).to_string()]);
                if !matches!(format, "wav" | "flac") {
                    args.extend(["-b:a".to_string(), "192k".to_string()]);
                }
                // Opus only accepts 48 kHz family rates
                if format != "opus" {
                    args.extend(["-ar".to_string(), "44100".to_string()]);
                }
                args.extend(self.ffmpeg_reporting_args());
                args.push(out);
                Invocation {
                    program: self.tools.ffmpeg.clone(),
                    args,
                }
            }
            AdapterFamily::Video => {
                let (video_codec, audio_codec) = video_codecs(format);
                let mut args = vec!["-y".to_string(), "-i".to_string(), input];
                args.extend(["-c:v".to_string(), video_codec.to_string()]);
                if video_codec == "libx264" {
                    args.extend(["-preset".to_string(), "fast".to_string()]);
                }
                args.extend(["-c:a".to_string(), audio_codec.to_string()]);
                args.extend(self.ffmpeg_reporting_args());
                args.push(out);
                Invocation {
                    program: self.tools.ffmpeg.clone(),
                    args,
                }
            }
            AdapterFamily::Image => Invocation {
                program: self.tools.imagemagick.clone(),
                args: vec![input, "-quality".to_string(), "85".to_string(), out],
            },
            AdapterFamily::Document => {
                let mut args = vec![input, "-o".to_string(), out];
                match format {
                    // pdf is inferred from the output extension
                    "pdf" => {}
                    "txt" => args.push("--to=plain".to_string()),
                    "md" => args.push("--to=markdown".to_string()),
                    other => args.push(format!("--to={}", other)),
                }
                Invocation {
                    program: self.tools.pandoc.clone(),
                    args,
                }
            }
            AdapterFamily::Ebook => Invocation {
                program: self.tools.ebook_convert.clone(),
                args: vec![input, out],
            },
            AdapterFamily::Archive => self.archive_invocation(request, output),
            AdapterFamily::Ocr => {
                // tesseract appends the extension itself
                let suffix = format!(".{}", format);
                let base = out.strip_suffix(&suffix).unwrap_or(&out).to_string();
                Invocation {
                    program: self.tools.tesseract.clone(),
                    args: vec![input, base, format.to_string()],
                }
            }
        }
    }

    fn archive_invocation(&self, request: &ConversionRequest, output: &Path) -> Invocation {
        let out = path_arg(output);
        match request.output_format.as_str() {
            "zip" => Invocation {
                program: self.tools.zip.clone(),
                args: vec![
                    "-j".to_string(),
                    "-q".to_string(),
                    out,
                    path_arg(&request.input_path),
                ],
            },
            "7z" => Invocation {
                program: self.tools.seven_zip.clone(),
                args: vec![
                    "a".to_string(),
                    "-y".to_string(),
                    out,
                    path_arg(&request.input_path),
                ],
            },
            tar_format => {
                let mode = match tar_format {
                    "tar.gz" => "-czf",
                    "tar.bz2" => "-cjf",
                    "tar.xz" => "-cJf",
                    _ => "-cf",
                };
                let dir = request
                    .input_path
                    .parent()
                    .map(path_arg)
                    .unwrap_or_else(|| ".".to_string());
                let name = request
                    .input_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                Invocation {
                    program: self.tools.tar.clone(),
                    args: vec!["-C".to_string(), dir, mode.to_string(), out, name],
                }
            }
        }
    }

    fn ffmpeg_reporting_args(&self) -> [String; 4] {
        [
            "-loglevel".to_string(),
            self.tools.ffmpeg_log_level.clone(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ]
    }

    async fn run(
        &self,
        request: &ConversionRequest,
        progress_tx: Option<mpsc::Sender<ConversionProgress>>,
    ) -> Result<ConversionResult, ConverterError> {
        let start = Instant::now();

        if fs::metadata(&request.input_path).await.is_err() {
            return Err(ConverterError::InputNotFound {
                path: request.input_path.clone(),
            });
        }

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = partial_output_path(&request.output_path);
        discard(&partial).await;

        let invocation = self.build_invocation(request, &partial);
        debug!(
            "Running {} for job {}: {} {:?}",
            self.tool(),
            request.job_id,
            invocation.program.display(),
            invocation.args
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    ConverterError::ToolNotFound {
                        tool: self.tool().to_string(),
                        path: invocation.program.clone(),
                    }
                } else {
                    ConverterError::Io(e)
                }
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not captured"))?;
        let mut reader = BufReader::new(stderr).lines();
        let mut tracker = ProgressTracker::new(&request.job_id);

        let outcome = {
            let drive = async {
                let mut tail = StderrTail::default();
                while let Some(line) = reader.next_line().await? {
                    if let Some(ref tx) = progress_tx {
                        if let Some(progress) = tracker.observe(&line) {
                            // Non-blocking send
                            let _ = tx.try_send(progress);
                        }
                    }
                    tail.push(line);
                }
                let status = child.wait().await?;
                Ok::<(ExitStatus, String), io::Error>((status, tail.into_string()))
            };

            tokio::select! {
                result = timeout(request.timeout, drive) => match result {
                    Ok(Ok((status, stderr))) => RunOutcome::Exited(status, stderr),
                    Ok(Err(e)) => RunOutcome::Io(e),
                    Err(_) => RunOutcome::TimedOut,
                },
                _ = request.cancel.cancelled() => RunOutcome::Cancelled,
            }
        };

        match outcome {
            RunOutcome::Exited(status, _) if status.success() => {}
            RunOutcome::Exited(status, stderr) => {
                warn!(
                    "{} failed for job {} with code {:?}: {}",
                    self.tool(),
                    request.job_id,
                    status.code(),
                    stderr
                );
                discard(&partial).await;
                return Err(ConverterError::execution_failed(
                    self.tool(),
                    status.code(),
                    stderr,
                ));
            }
            RunOutcome::Io(e) => {
                let _ = child.kill().await;
                discard(&partial).await;
                return Err(ConverterError::Io(e));
            }
            RunOutcome::TimedOut => {
                warn!(
                    "{} timed out for job {} after {:?}, killing",
                    self.tool(),
                    request.job_id,
                    request.timeout
                );
                let _ = child.kill().await;
                discard(&partial).await;
                return Err(ConverterError::Timeout {
                    timeout_secs: request.timeout_secs(),
                });
            }
            RunOutcome::Cancelled => {
                debug!("Cancelling {} for job {}", self.tool(), request.job_id);
                let _ = child.kill().await;
                discard(&partial).await;
                return Err(ConverterError::Cancelled);
            }
        }

        let output_size = match fs::metadata(&partial).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                discard(&partial).await;
                return Err(ConverterError::MissingOutput {
                    tool: self.tool().to_string(),
                });
            }
        };

        if let Err(e) = fs::rename(&partial, &request.output_path).await {
            discard(&partial).await;
            return Err(ConverterError::Io(e));
        }

        Ok(ConversionResult {
            job_id: request.job_id.clone(),
            output_path: request.output_path.clone(),
            output_size_bytes: output_size,
            duration_ms: start.elapsed().as_millis() as u64,
            tool: self.tool().to_string(),
        })
    }
}

#[async_trait]
impl Converter for ToolConverter {
    fn family(&self) -> AdapterFamily {
        self.family
    }

    fn tool(&self) -> &str {
        Self::tool_name(self.family)
    }

    async fn execute(&self, request: &ConversionRequest) -> Result<ConversionResult, ConverterError> {
        self.run(request, None).await
    }

    async fn execute_with_progress(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<ConversionProgress>,
    ) -> Result<ConversionResult, ConverterError> {
        self.run(request, Some(progress_tx)).await
    }

    async fn validate(&self) -> Result<(), ConverterError> {
        for (program, probe_arg) in self.programs() {
            let result = Command::new(program)
                .arg(probe_arg)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            if let Err(e) = result {
                if e.kind() == io::ErrorKind::NotFound {
                    return Err(ConverterError::ToolNotFound {
                        tool: self.tool().to_string(),
                        path: program.to_path_buf(),
                    });
                }
                return Err(ConverterError::Io(e));
            }
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn audio_codec(format: &str) -> &'static str {
    match format {
        "mp3" => "libmp3lame",
        "flac" => "flac",
        "ogg" => "libvorbis",
        "opus" => "libopus",
        "aac" | "m4a" => "aac",
        _ => "pcm_s16le",
    }
}

fn video_codecs(format: &str) -> (&'static str, &'static str) {
    match format {
        "webm" => ("libvpx-vp9", "libopus"),
        "avi" => ("mpeg4", "libmp3lame"),
        _ => ("libx264", "aac"),
    }
}

/// Sibling path the tool writes to before the result is moved into place.
/// Keeps the full file name so tools that infer the format from the
/// extension still see it.
pub(crate) fn partial_output_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".partial-{}", name))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {}: {}", path.display(), e);
        }
    }
}

/// Bounded tail of a tool's stderr, without ffmpeg progress lines.
#[derive(Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if is_progress_line(&line) {
            return;
        }
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_string(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

/// `key=value` lines emitted by `-progress`.
fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Turns ffmpeg stderr into progress updates.
struct ProgressTracker {
    job_id: String,
    duration_secs: Option<f64>,
    current_secs: f64,
    speed: Option<String>,
    last_sent: Option<Instant>,
    interval: Duration,
    duration_re: Option<Regex>,
    time_re: Option<Regex>,
    speed_re: Option<Regex>,
}

impl ProgressTracker {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            duration_secs: None,
            current_secs: 0.0,
            speed: None,
            last_sent: None,
            interval: Duration::from_millis(500),
            duration_re: Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").ok(),
            time_re: Regex::new(r"out_time_ms=(\d+)").ok(),
            speed_re: Regex::new(r"speed=\s*(\d+\.?\d*)x").ok(),
        }
    }

    /// Feed one stderr line; returns an update when one is due.
    fn observe(&mut self, line: &str) -> Option<ConversionProgress> {
        if let Some(caps) = self.duration_re.as_ref().and_then(|re| re.captures(line)) {
            let h: f64 = caps.get(1)?.as_str().parse().ok()?;
            let m: f64 = caps.get(2)?.as_str().parse().ok()?;
            let s: f64 = caps.get(3)?.as_str().parse().ok()?;
            self.duration_secs = Some(h * 3600.0 + m * 60.0 + s);
            return None;
        }

        if let Some(caps) = self.speed_re.as_ref().and_then(|re| re.captures(line)) {
            self.speed = caps.get(1).map(|m| format!("{}x", m.as_str()));
            return None;
        }

        let caps = self.time_re.as_ref().and_then(|re| re.captures(line))?;
        let micros: f64 = caps.get(1)?.as_str().parse().ok()?;
        // out_time_ms is reported in microseconds
        self.current_secs = micros / 1_000_000.0;

        if self
            .last_sent
            .is_some_and(|sent| sent.elapsed() < self.interval)
        {
            return None;
        }
        self.last_sent = Some(Instant::now());

        let percent = match self.duration_secs {
            Some(total) if total > 0.0 => (self.current_secs / total * 100.0).min(100.0) as f32,
            _ => 0.0,
        };

        Some(ConversionProgress {
            job_id: self.job_id.clone(),
            percent,
            time_secs: self.current_secs,
            duration_secs: self.duration_secs,
            speed: self.speed.clone(),
        })
    }
}
