//! SureFetch - resilient single-file HTTP downloads.
//!
//! The engine fetches one artifact per call with bounded retries and
//! exponential backoff, resumes interrupted transfers from a `.part` file
//! via HTTP range requests, reports throttled progress with speed and ETA,
//! and verifies the result against an MD5, SHA-256 or SHA-512 digest.
//!
//! Hosts construct a [`DownloadManager`] once and call
//! [`download`](DownloadManager::download) per destination.

pub mod config;
pub mod download;
pub mod error;
pub mod logging;

pub use config::{DownloadConfiguration, DownloadOptions, ResolvedOptions};
pub use download::{
    ChecksumVerifier, DownloadManager, DownloadOutcome, DownloadResult, EnhancedDownloadProgress,
    HashAlgorithm, Phase, ProgressSink,
};
pub use error::{ConfigError, DownloadError};
