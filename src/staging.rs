//! Firmware staging.
//!
//! Uploads land in a staging directory that is bind-mounted into every
//! toolchain container at the same path, so the staged path is valid in
//! both views. Each dispatch owns exactly one staged file, named by uuid;
//! the `StagedFirmware` guard deletes it when the dispatch ends, whatever
//! the outcome.

use crate::config::ServerConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("firmware filename has no extension")]
    MissingExtension,

    #[error("firmware extension '.{0}' is not allowed")]
    ExtensionNotAllowed(String),

    #[error("firmware exceeds the {limit_mb} MB upload limit")]
    TooLarge { limit_mb: u64 },

    #[error("staging I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The staging directory plus its upload policy.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    max_bytes: u64,
    allowed_extensions: Vec<String>,
}

impl StagingArea {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            dir: server.staging_dir.clone(),
            max_bytes: server.max_upload_mb * 1024 * 1024,
            allowed_extensions: server
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extension of `filename`, checked against the allow-list.
    pub fn check_extension(&self, filename: &str) -> Result<String, StagingError> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or(StagingError::MissingExtension)?;
        if !self.allowed_extensions.iter().any(|a| a == &ext) {
            return Err(StagingError::ExtensionNotAllowed(ext));
        }
        Ok(ext)
    }

    /// Open a staged upload for `filename`. Chunks are written through
    /// [`StagedUpload::write_chunk`]; the size cap is enforced as data
    /// arrives, not after.
    pub async fn begin(&self, filename: &str) -> Result<StagedUpload, StagingError> {
        let ext = self.check_extension(filename)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(format!("{}.{ext}", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;
        debug!(path = %path.display(), original = filename, "staging upload");

        Ok(StagedUpload {
            guard: StagedFirmware { path },
            file: Some(file),
            written: 0,
            max_bytes: self.max_bytes,
        })
    }
}

/// An upload in progress. Dropping it mid-stream removes the partial file.
pub struct StagedUpload {
    guard: StagedFirmware,
    file: Option<tokio::fs::File>,
    written: u64,
    max_bytes: u64,
}

impl StagedUpload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        self.written += chunk.len() as u64;
        if self.written > self.max_bytes {
            return Err(StagingError::TooLarge {
                limit_mb: self.max_bytes / (1024 * 1024),
            });
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Flush and seal the upload, handing ownership of the staged file to
    /// the returned guard.
    pub async fn finish(mut self) -> Result<StagedFirmware, StagingError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(std::mem::replace(
            &mut self.guard,
            StagedFirmware {
                path: PathBuf::new(),
            },
        ))
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

/// A staged firmware file. Deleted on drop, so no dispatch outcome leaks
/// staging entries.
pub struct StagedFirmware {
    path: PathBuf,
}

impl StagedFirmware {
    /// Path of the staged file, identical inside the container.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFirmware {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staged firmware removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staged firmware"),
        }
    }
}

impl std::fmt::Debug for StagedFirmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedFirmware")
            .field("path", &self.path)
            .finish()
    }
}
