//! Terminal outcome of a download call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::state::RetryState;
use crate::error::DownloadError;

/// How a download call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The file is at its destination (and verified, if requested).
    Completed,
    /// Transport, HTTP or integrity failure.
    Failed,
    /// Stopped by the caller; the partial file was kept.
    Cancelled,
}

/// Result of [`DownloadManager::download`](super::DownloadManager::download).
///
/// Failures and cancellation are reported here rather than as `Err`, so the
/// retry count, resume flag and byte count stay inspectable either way.
#[derive(Debug)]
pub struct DownloadResult {
    pub outcome: DownloadOutcome,
    pub success: bool,
    /// Destination path.
    pub file_path: PathBuf,
    /// Bytes on disk at the end of the call, including resumed bytes.
    pub bytes_downloaded: u64,
    /// Lowercase hex digest, when one was computed.
    pub actual_hash: Option<String>,
    /// `None` when no verification was requested.
    pub hash_verified: Option<bool>,
    pub retry_attempts: u32,
    pub was_resumed: bool,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub error: Option<DownloadError>,
}

impl DownloadResult {
    /// Successful transfer.
    pub fn completed(
        file_path: &Path,
        bytes_downloaded: u64,
        retry: &RetryState,
        duration: Duration,
    ) -> Self {
        Self::new(DownloadOutcome::Completed, file_path, bytes_downloaded, retry, duration, None)
    }

    /// Failed transfer or verification.
    pub fn failed(
        file_path: &Path,
        bytes_downloaded: u64,
        retry: &RetryState,
        duration: Duration,
        error: DownloadError,
    ) -> Self {
        Self::new(
            DownloadOutcome::Failed,
            file_path,
            bytes_downloaded,
            retry,
            duration,
            Some(error),
        )
    }

    /// Cancelled by the caller.
    pub fn cancelled(
        file_path: &Path,
        bytes_downloaded: u64,
        retry: &RetryState,
        duration: Duration,
    ) -> Self {
        Self::new(
            DownloadOutcome::Cancelled,
            file_path,
            bytes_downloaded,
            retry,
            duration,
            Some(DownloadError::Cancelled),
        )
    }

    /// Attach digest fields.
    pub fn with_hash(mut self, actual_hash: Option<String>, hash_verified: Option<bool>) -> Self {
        self.actual_hash = actual_hash;
        self.hash_verified = hash_verified;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == DownloadOutcome::Cancelled
    }

    fn new(
        outcome: DownloadOutcome,
        file_path: &Path,
        bytes_downloaded: u64,
        retry: &RetryState,
        duration: Duration,
        error: Option<DownloadError>,
    ) -> Self {
        Self {
            outcome,
            success: outcome == DownloadOutcome::Completed,
            file_path: file_path.to_path_buf(),
            bytes_downloaded,
            actual_hash: None,
            hash_verified: None,
            retry_attempts: retry.attempt,
            was_resumed: retry.was_resumed,
            duration,
            error_message: error.as_ref().map(ToString::to_string),
            error,
        }
    }
}
