//! Single-file HTTP download engine.
//!
//! This module provides:
//! - Retry, resume and verify orchestration (`manager`)
//! - Exponential backoff between attempts (`backoff`)
//! - Resume eligibility and response classification (`range`)
//! - Throttled progress with speed and ETA (`progress`)
//! - MD5 / SHA-256 / SHA-512 verification (`checksum`)
//! - The on-disk `.part` file lifecycle (`partial`)
//!
//! # Architecture
//!
//! ```text
//! DownloadManager (state machine, one call per destination)
//!         │
//!         ├── RangeNegotiator (fresh vs resume, classify response)
//!         │
//!         ├── PartialFile (<destination>.part)
//!         │
//!         ├── BackoffPolicy + RetryState (bounded retries)
//!         │
//!         ├── ProgressReporter ──► ProgressSink (caller)
//!         │
//!         └── ChecksumVerifier (post-transfer integrity)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::path::Path;
//! use surefetch::download::{DownloadManager, HashAlgorithm};
//! use surefetch::DownloadOptions;
//!
//! let manager = DownloadManager::new()?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let options = DownloadOptions::new().with_expected_hash(digest, HashAlgorithm::Sha256);
//! let result = manager
//!     .download(url, Path::new("release.zip"), Some(&options), Some(&tx))
//!     .await?;
//! ```

mod backoff;
mod checksum;
mod manager;
mod partial;
mod progress;
mod range;
mod result;
mod state;

pub use backoff::{
    backoff_delay, BackoffPolicy, DEFAULT_INITIAL_BACKOFF_SECS, DEFAULT_MAX_BACKOFF_SECS,
};
pub use checksum::{normalize_digest, ChecksumVerifier, HashAlgorithm, Verification};
pub use manager::DownloadManager;
pub use partial::{PartialFile, PartialInfo, PARTIAL_SUFFIX};
pub use progress::{
    CallbackSink, EnhancedDownloadProgress, NullSink, Phase, ProgressReporter, ProgressSink,
};
pub use range::{
    parse_content_range, ContentRange, FreshReason, RangeNegotiator, RangeOutcome, ResumeDecision,
};
pub use result::{DownloadOutcome, DownloadResult};
pub use state::RetryState;
