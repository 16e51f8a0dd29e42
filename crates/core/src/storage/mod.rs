//! On-disk layout for uploaded inputs and conversion outputs.
//!
//! Every job owns two directories, `<upload_dir>/<job_id>/` and
//! `<results_dir>/<job_id>/`. Nothing else is written under those roots.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::StorageConfig;
use crate::job::Job;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("source file not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("invalid file name: {name:?}")]
    InvalidFilename { name: String },

    #[error("failed to create directory: {path}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stage {source_path} into {destination}")]
    StageFailed {
        source_path: PathBuf,
        destination: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("failed to remove {path}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How an upload is brought into the job's upload directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageMode {
    /// Rename, falling back to copy-then-delete across filesystems.
    #[default]
    Move,
    /// Copy and leave the source in place.
    Copy,
}

/// Paths of the per-job artifact directories.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    upload_dir: PathBuf,
    results_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(upload_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.upload_dir, &config.results_dir)
    }

    pub fn job_upload_dir(&self, job_id: &str) -> PathBuf {
        self.upload_dir.join(job_id)
    }

    pub fn job_results_dir(&self, job_id: &str) -> PathBuf {
        self.results_dir.join(job_id)
    }

    /// Where the job's staged input lives.
    pub fn input_path(&self, job: &Job) -> PathBuf {
        self.job_upload_dir(&job.id).join(&job.input_filename)
    }

    /// Where the job's converted output is written.
    pub fn output_path(&self, job: &Job) -> PathBuf {
        self.job_results_dir(&job.id).join(&job.output_filename)
    }

    /// Create both roots if they do not exist yet.
    pub async fn ensure_roots(&self) -> Result<(), StorageError> {
        for dir in [&self.upload_dir, &self.results_dir] {
            create_dir(dir).await?;
        }
        Ok(())
    }

    /// Bring `source` into `<upload_dir>/<job_id>/<input_filename>`.
    pub async fn stage_upload(
        &self,
        job: &Job,
        source: &Path,
        mode: StageMode,
    ) -> Result<PathBuf, StorageError> {
        if fs::metadata(source).await.is_err() {
            return Err(StorageError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }

        let dir = self.job_upload_dir(&job.id);
        create_dir(&dir).await?;
        let destination = dir.join(&job.input_filename);

        let stage_err = |error| StorageError::StageFailed {
            source_path: source.to_path_buf(),
            destination: destination.clone(),
            error,
        };

        match mode {
            StageMode::Move => {
                if !move_file(source, &destination).await.map_err(stage_err)? {
                    debug!(
                        "Cross-device stage for job {}, copied {}",
                        job.id,
                        source.display()
                    );
                }
            }
            StageMode::Copy => {
                fs::copy(source, &destination).await.map_err(stage_err)?;
            }
        }

        Ok(destination)
    }

    /// Undo a `Move` stage, putting the staged file back at `source`.
    pub async fn restore_upload(&self, staged: &Path, source: &Path) -> Result<(), StorageError> {
        move_file(staged, source)
            .await
            .map_err(|error| StorageError::StageFailed {
                source_path: staged.to_path_buf(),
                destination: source.to_path_buf(),
                error,
            })?;
        Ok(())
    }

    /// Remove both artifact directories of a job. Missing directories are not
    /// an error. Returns how many directories were actually removed.
    pub async fn remove_job_dirs(&self, job_id: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for dir in [self.job_upload_dir(job_id), self.job_results_dir(job_id)] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::RemoveFailed { path: dir, source }),
            }
        }
        Ok(removed)
    }
}

/// Reduce a client-supplied name to its final path component.
pub fn sanitize_filename(name: &str) -> Result<String, StorageError> {
    let invalid = || StorageError::InvalidFilename {
        name: name.to_string(),
    };
    let file_name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(invalid)?;
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(invalid());
    }
    Ok(file_name.to_string())
}

async fn create_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Rename, reporting `false` when source and destination are on different
/// filesystems.
async fn try_rename(source: &Path, destination: &Path) -> Result<bool, io::Error> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Rename, or copy then delete across filesystems. Returns whether the
/// rename succeeded.
async fn move_file(source: &Path, destination: &Path) -> Result<bool, io::Error> {
    if try_rename(source, destination).await? {
        return Ok(true);
    }
    fs::copy(source, destination).await?;
    fs::remove_file(source).await?;
    Ok(false)
}
