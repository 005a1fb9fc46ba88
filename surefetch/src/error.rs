//! Error types for the download engine.
//!
//! Errors fall into four classes that callers treat differently:
//!
//! - **Precondition** violations (bad URL, unwritable destination, missing
//!   file for verification, unsupported algorithm) are returned as `Err`
//!   before any network activity.
//! - **Transient** failures (connection errors, timeouts, 5xx, throttling)
//!   are retried with backoff inside the manager.
//! - **Non-retryable** HTTP failures (other 4xx) end the transfer at once.
//! - **Integrity** failures (digest mismatch) turn a completed transfer
//!   into a failed result.
//!
//! Everything except the precondition class is reported through
//! [`DownloadResult`](crate::download::DownloadResult) rather than `Err`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::download::HashAlgorithm;

/// Errors that can occur while downloading or verifying a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The URL could not be parsed as an absolute http(s) URI.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A configured request header has an invalid name or value.
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to initialize HTTP client: {0}")]
    ClientInit(#[source] reqwest::Error),

    /// The destination path cannot name a file.
    #[error("invalid destination {}: {reason}", path.display())]
    InvalidDestination { path: PathBuf, reason: String },

    /// The destination directory cannot be created or written to.
    #[error("destination {} is not writable: {source}", path.display())]
    DestinationNotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file to verify does not exist.
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Verification was requested with no usable digest function.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(HashAlgorithm),

    /// The server answered with an error status.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Connection or body transfer failed.
    #[error("transfer from {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The attempt exceeded its per-attempt timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The body ended before the advertised length was received.
    #[error("connection closed after {received} of {expected} bytes")]
    IncompleteBody { expected: u64, received: u64 },

    /// A partial-content response did not start at the requested offset.
    #[error("resume position mismatch: requested byte {expected}, server sent {actual:?}")]
    RangeMismatch { expected: u64, actual: Option<u64> },

    /// Failed to read a local file.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a local file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The downloaded file does not match the expected digest.
    #[error("checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The caller cancelled the transfer.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether the failure is worth another attempt after a backoff wait.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => is_transient_status(*status),
            Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::IncompleteBody { .. }
            | Self::RangeMismatch { .. }
            | Self::ReadFailed { .. }
            | Self::WriteFailed { .. } => true,
            _ => false,
        }
    }

    /// Whether the error signals caller misuse rather than an environmental failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::InvalidHeader { .. }
                | Self::InvalidDestination { .. }
                | Self::DestinationNotWritable { .. }
                | Self::FileNotFound { .. }
                | Self::UnsupportedAlgorithm(_)
        )
    }

    pub(crate) fn from_reqwest(url: &str, timeout_secs: u64, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                timeout_secs,
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// 5xx plus the throttling codes (408 Request Timeout, 429 Too Many Requests).
pub(crate) fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed as INI.
    #[error("failed to read config {}: {reason}", path.display())]
    ReadFailed { path: PathBuf, reason: String },

    /// A key held a value of the wrong shape.
    #[error("invalid value for [{section}] {key}: {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}
