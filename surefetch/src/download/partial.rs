//! On-disk partial file for an in-flight download.
//!
//! Bytes accumulate in a sibling of the destination named
//! `<destination>.part`. The file survives transient failures, cancellation
//! and process restarts so a later attempt can resume from it, and is
//! promoted to the destination only once the transfer is complete.
//!
//! A partial file has exactly one writer; callers must not run two
//! downloads to the same destination at once.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, File, OpenOptions};

use crate::error::DownloadError;

/// Suffix appended to the destination file name.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Size and age of an existing partial file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialInfo {
    /// Bytes already on disk.
    pub size: u64,
    /// Time since the file was last written.
    pub age: Duration,
}

/// Handle to the partial file belonging to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFile {
    path: PathBuf,
}

impl PartialFile {
    /// Partial file for `destination`.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidDestination`] if `destination` has no file name
    /// (e.g. `/` or `..`).
    pub fn for_destination(destination: &Path) -> Result<Self, DownloadError> {
        let file_name = destination
            .file_name()
            .ok_or_else(|| DownloadError::InvalidDestination {
                path: destination.to_path_buf(),
                reason: "path does not name a file".to_string(),
            })?;

        let mut partial_name = OsString::from(file_name);
        partial_name.push(PARTIAL_SUFFIX);

        Ok(Self {
            path: destination.with_file_name(partial_name),
        })
    }

    /// Path of the partial file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists and the partial file can be created.
    ///
    /// Existing contents are left untouched.
    pub async fn ensure_writable(&self) -> Result<(), DownloadError> {
        let not_writable = |path: &Path, source| DownloadError::DestinationNotWritable {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| not_writable(parent, e))?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map(drop)
            .map_err(|e| not_writable(&self.path, e))
    }

    /// Size and age of the partial file, or `None` if it does not exist.
    pub async fn inspect(&self) -> Option<PartialInfo> {
        let metadata = fs::metadata(&self.path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);

        Some(PartialInfo {
            size: metadata.len(),
            age,
        })
    }

    /// Open for writing from byte 0, truncating any previous contents.
    pub async fn open_fresh(&self) -> Result<File, DownloadError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|source| self.write_failed(source))
    }

    /// Open for appending after the existing contents.
    pub async fn open_append(&self) -> Result<File, DownloadError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.write_failed(source))
    }

    /// Remove the partial file if present.
    pub async fn discard(&self) -> Result<(), DownloadError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.write_failed(source)),
        }
    }

    /// Move the partial file over `destination`.
    ///
    /// Rename replaces an existing file atomically on Unix. Where rename
    /// refuses to overwrite (Windows), the destination is removed first and
    /// the rename retried.
    pub async fn promote(&self, destination: &Path) -> Result<(), DownloadError> {
        match fs::rename(&self.path, destination).await {
            Ok(()) => Ok(()),
            Err(first) => {
                if !fs::try_exists(destination).await.unwrap_or(false) {
                    return Err(self.write_failed(first));
                }
                tracing::debug!(
                    destination = %destination.display(),
                    error = %first,
                    "Rename over existing file failed, replacing"
                );
                fs::remove_file(destination)
                    .await
                    .map_err(|source| DownloadError::WriteFailed {
                        path: destination.to_path_buf(),
                        source,
                    })?;
                fs::rename(&self.path, destination)
                    .await
                    .map_err(|source| self.write_failed(source))
            }
        }
    }

    fn write_failed(&self, source: io::Error) -> DownloadError {
        DownloadError::WriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}
