//! Configuration for the download engine.
//!
//! Two layers, merged field by field for every call:
//!
//! - [`DownloadConfiguration`]: engine-wide defaults owned by a
//!   [`DownloadManager`](crate::download::DownloadManager). Can be loaded from
//!   an INI file.
//! - [`DownloadOptions`]: optional per-call overrides. Every field is an
//!   `Option`; `None` inherits the configuration value.
//!
//! [`DownloadConfiguration::resolve`] produces a [`ResolvedOptions`] holding
//! the concrete values one call runs with.
//!
//! # Defaults
//!
//! | Setting                      | Default        |
//! |------------------------------|----------------|
//! | `max_retries`                | 5              |
//! | `timeout`                    | 5 minutes      |
//! | `allow_resume`               | true           |
//! | `resume_threshold`           | 1 MiB          |
//! | `initial_backoff`            | 1 s            |
//! | `max_backoff`                | 30 s           |
//! | `buffer_size`                | 8192 bytes     |
//! | `progress_update_interval`   | 100 ms         |
//! | `speed_calculation_samples`  | 10             |
//! | `auto_verify_checksums`      | true           |
//! | `cleanup_partial_on_success` | true           |
//! | `partial_file_max_age`       | 24 hours       |
//!
//! # INI file
//!
//! ```ini
//! [download]
//! max_retries = 3
//! timeout_secs = 120
//! allow_resume = true
//! resume_threshold_bytes = 1048576
//! initial_backoff_secs = 1
//! max_backoff_secs = 30
//! buffer_size = 8192
//! user_agent = my-installer/2.0
//! hash_algorithm = sha256
//!
//! [engine]
//! progress_update_interval_ms = 100
//! speed_calculation_samples = 10
//! auto_verify_checksums = true
//! cleanup_partial_on_success = true
//! partial_file_max_age_hours = 24
//! delete_corrupted_files = true
//! reuse_verified_destination = true
//!
//! [headers]
//! X-Client = installer
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::download::{
    BackoffPolicy, HashAlgorithm, DEFAULT_INITIAL_BACKOFF_SECS, DEFAULT_MAX_BACKOFF_SECS,
};
use crate::error::{ConfigError, DownloadError};

/// Default retry ceiling (retries after the first attempt).
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default per-attempt timeout (5 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 5 * 60;

/// Default streaming chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default minimum partial-file size before resume is attempted (1 MiB).
pub const DEFAULT_RESUME_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Default interval between progress emissions.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Default number of samples in the speed window.
pub const DEFAULT_SPEED_SAMPLES: usize = 10;

/// Default age after which a partial file is stale (24 hours).
pub const DEFAULT_PARTIAL_MAX_AGE_HOURS: u64 = 24;

/// Configuration file name inside the platform config directory.
const CONFIG_DIR_NAME: &str = "surefetch";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Default `User-Agent` header.
pub fn default_user_agent() -> String {
    format!("surefetch/{}", env!("CARGO_PKG_VERSION"))
}

/// Per-call overrides. Unset fields inherit from [`DownloadConfiguration`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOptions {
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout covering connect and body transfer.
    pub timeout: Option<Duration>,
    /// Whether an existing partial file may be resumed.
    pub allow_resume: Option<bool>,
    /// Expected digest of the finished file.
    pub expected_hash: Option<String>,
    /// Digest function for `expected_hash`.
    pub hash_algorithm: Option<HashAlgorithm>,
    /// Maximum bytes written per chunk.
    pub buffer_size: Option<usize>,
    /// Minimum partial-file size before resume is attempted.
    pub resume_threshold: Option<u64>,
    /// Delay before the first retry.
    pub initial_backoff: Option<Duration>,
    /// Upper bound for any retry delay.
    pub max_backoff: Option<Duration>,
    /// `User-Agent` request header.
    pub user_agent: Option<String>,
    /// Extra request headers, sent in order.
    pub custom_headers: Option<Vec<(String, String)>>,
}

impl DownloadOptions {
    /// Create options that inherit everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable resume.
    pub fn with_allow_resume(mut self, allow: bool) -> Self {
        self.allow_resume = Some(allow);
        self
    }

    /// Require the finished file to match `hash` under `algorithm`.
    pub fn with_expected_hash(mut self, hash: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        self.expected_hash = Some(hash.into());
        self.hash_algorithm = Some(algorithm);
        self
    }

    /// Set only the digest function; the actual digest is reported without comparison.
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = Some(algorithm);
        self
    }

    /// Set the streaming chunk size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set the minimum partial-file size for resume.
    pub fn with_resume_threshold(mut self, bytes: u64) -> Self {
        self.resume_threshold = Some(bytes);
        self
    }

    /// Set both backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = Some(initial);
        self.max_backoff = Some(max);
        self
    }

    /// Set the `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Append a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }
}

/// Engine-wide defaults and policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfiguration {
    pub max_retries: u32,
    pub timeout: Duration,
    pub allow_resume: bool,
    pub buffer_size: usize,
    pub resume_threshold: u64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub user_agent: String,
    pub custom_headers: Vec<(String, String)>,
    /// Digest function used when a call gives a hash but no algorithm.
    pub hash_algorithm: HashAlgorithm,

    /// Minimum time between throttled progress emissions.
    pub progress_update_interval: Duration,
    /// Number of samples in the rolling speed window.
    pub speed_calculation_samples: usize,
    /// Verify whenever an expected hash is present, inferring the algorithm
    /// from the digest length if none is given.
    pub auto_verify_checksums: bool,
    /// Remove a leftover partial file once the destination is in place.
    pub cleanup_partial_on_success: bool,
    /// Partial files older than this are discarded instead of resumed.
    pub partial_file_max_age: Duration,
    /// Remove the destination when its digest does not match.
    pub delete_corrupted_files: bool,
    /// Skip the network when the destination already matches the expected hash.
    pub reuse_verified_destination: bool,
}

impl Default for DownloadConfiguration {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            allow_resume: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            resume_threshold: DEFAULT_RESUME_THRESHOLD_BYTES,
            initial_backoff: Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            user_agent: default_user_agent(),
            custom_headers: Vec::new(),
            hash_algorithm: HashAlgorithm::None,
            progress_update_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            speed_calculation_samples: DEFAULT_SPEED_SAMPLES,
            auto_verify_checksums: true,
            cleanup_partial_on_success: true,
            partial_file_max_age: Duration::from_secs(DEFAULT_PARTIAL_MAX_AGE_HOURS * 3600),
            delete_corrupted_files: true,
            reuse_verified_destination: true,
        }
    }
}

impl DownloadConfiguration {
    /// Set the default retry ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the default per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the default backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the progress throttle interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_update_interval = interval;
        self
    }

    /// Set the resume threshold.
    pub fn with_resume_threshold(mut self, bytes: u64) -> Self {
        self.resume_threshold = bytes;
        self
    }

    /// Set the partial-file staleness bound.
    pub fn with_partial_file_max_age(mut self, age: Duration) -> Self {
        self.partial_file_max_age = age;
        self
    }

    /// Enable or disable the verified-destination fast path.
    pub fn with_reuse_verified_destination(mut self, reuse: bool) -> Self {
        self.reuse_verified_destination = reuse;
        self
    }

    /// Enable or disable automatic verification.
    pub fn with_auto_verify(mut self, verify: bool) -> Self {
        self.auto_verify_checksums = verify;
        self
    }

    /// Platform location of the configuration file, e.g.
    /// `~/.config/surefetch/config.ini` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the default configuration file if it exists, else the defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an INI file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Build a configuration from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::ReadFailed {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("download")) {
            let s = "download";
            if let Some(v) = parse_key(section, s, "max_retries")? {
                config.max_retries = v;
            }
            if let Some(v) = parse_key(section, s, "timeout_secs")? {
                config.timeout = Duration::from_secs(v);
            }
            if let Some(v) = parse_key(section, s, "allow_resume")? {
                config.allow_resume = v;
            }
            if let Some(v) = parse_key(section, s, "buffer_size")? {
                config.buffer_size = v;
            }
            if let Some(v) = parse_key(section, s, "resume_threshold_bytes")? {
                config.resume_threshold = v;
            }
            if let Some(v) = parse_key(section, s, "initial_backoff_secs")? {
                config.initial_backoff = Duration::from_secs(v);
            }
            if let Some(v) = parse_key(section, s, "max_backoff_secs")? {
                config.max_backoff = Duration::from_secs(v);
            }
            if let Some(v) = section.get("user_agent") {
                config.user_agent = v.to_string();
            }
            if let Some(v) = parse_key(section, s, "hash_algorithm")? {
                config.hash_algorithm = v;
            }
        }

        if let Some(section) = ini.section(Some("engine")) {
            let s = "engine";
            if let Some(v) = parse_key(section, s, "progress_update_interval_ms")? {
                config.progress_update_interval = Duration::from_millis(v);
            }
            if let Some(v) = parse_key(section, s, "speed_calculation_samples")? {
                config.speed_calculation_samples = v;
            }
            if let Some(v) = parse_key(section, s, "auto_verify_checksums")? {
                config.auto_verify_checksums = v;
            }
            if let Some(v) = parse_key(section, s, "cleanup_partial_on_success")? {
                config.cleanup_partial_on_success = v;
            }
            if let Some(v) = parse_key::<u64>(section, s, "partial_file_max_age_hours")? {
                config.partial_file_max_age = Duration::from_secs(v.saturating_mul(3600));
            }
            if let Some(v) = parse_key(section, s, "delete_corrupted_files")? {
                config.delete_corrupted_files = v;
            }
            if let Some(v) = parse_key(section, s, "reuse_verified_destination")? {
                config.reuse_verified_destination = v;
            }
        }

        if let Some(section) = ini.section(Some("headers")) {
            config.custom_headers = section
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }

        Ok(config)
    }

    /// Merge per-call overrides over these defaults.
    pub fn resolve(&self, options: Option<&DownloadOptions>) -> ResolvedOptions {
        let empty = DownloadOptions::default();
        let o = options.unwrap_or(&empty);

        let expected_hash = o
            .expected_hash
            .clone()
            .filter(|h| !h.trim().is_empty());
        let hash_algorithm = resolve_algorithm(
            o.hash_algorithm,
            self.hash_algorithm,
            expected_hash.as_deref(),
            self.auto_verify_checksums,
        );

        let mut custom_headers = self.custom_headers.clone();
        if let Some(extra) = &o.custom_headers {
            custom_headers.extend(extra.iter().cloned());
        }

        ResolvedOptions {
            max_retries: o.max_retries.unwrap_or(self.max_retries),
            timeout: o.timeout.unwrap_or(self.timeout),
            allow_resume: o.allow_resume.unwrap_or(self.allow_resume),
            expected_hash,
            hash_algorithm,
            buffer_size: o.buffer_size.unwrap_or(self.buffer_size).max(1),
            resume_threshold: o.resume_threshold.unwrap_or(self.resume_threshold),
            backoff: BackoffPolicy::new(
                o.initial_backoff.unwrap_or(self.initial_backoff),
                o.max_backoff.unwrap_or(self.max_backoff),
            ),
            user_agent: o.user_agent.clone().unwrap_or_else(|| self.user_agent.clone()),
            custom_headers,
            progress_update_interval: self.progress_update_interval,
            speed_calculation_samples: self.speed_calculation_samples.max(2),
            cleanup_partial_on_success: self.cleanup_partial_on_success,
            partial_file_max_age: self.partial_file_max_age,
            delete_corrupted_files: self.delete_corrupted_files,
            reuse_verified_destination: self.reuse_verified_destination,
        }
    }
}

/// Pick the digest function for a call.
///
/// An explicit per-call algorithm always wins (including `None`, which turns
/// verification off). Otherwise a hash with no algorithm uses the configured
/// default, or, with auto-verification on, the algorithm implied by the
/// digest length.
fn resolve_algorithm(
    explicit: Option<HashAlgorithm>,
    configured: HashAlgorithm,
    expected_hash: Option<&str>,
    auto_verify: bool,
) -> HashAlgorithm {
    if let Some(algorithm) = explicit {
        return algorithm;
    }
    let Some(hash) = expected_hash else {
        return HashAlgorithm::None;
    };
    if configured != HashAlgorithm::None {
        return configured;
    }
    if auto_verify {
        HashAlgorithm::infer(hash).unwrap_or(HashAlgorithm::None)
    } else {
        HashAlgorithm::None
    }
}

fn parse_key<T: FromStr>(section: &Properties, name: &str, key: &str) -> Result<Option<T>, ConfigError> {
    match section.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            section: name.to_string(),
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Fully-resolved settings for one download call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub max_retries: u32,
    pub timeout: Duration,
    pub allow_resume: bool,
    pub expected_hash: Option<String>,
    pub hash_algorithm: HashAlgorithm,
    pub buffer_size: usize,
    pub resume_threshold: u64,
    pub backoff: BackoffPolicy,
    pub user_agent: String,
    pub custom_headers: Vec<(String, String)>,
    pub progress_update_interval: Duration,
    pub speed_calculation_samples: usize,
    pub cleanup_partial_on_success: bool,
    pub partial_file_max_age: Duration,
    pub delete_corrupted_files: bool,
    pub reuse_verified_destination: bool,
}

impl ResolvedOptions {
    /// Whether the finished file is compared against an expected digest.
    pub fn verifies(&self) -> bool {
        self.expected_hash.is_some() && self.hash_algorithm != HashAlgorithm::None
    }

    /// Whether a digest is computed after the transfer (with or without comparison).
    pub fn computes_hash(&self) -> bool {
        self.hash_algorithm != HashAlgorithm::None
    }

    /// Reject an expected digest that no algorithm resolved for, so the
    /// call cannot silently skip verification.
    pub fn check_digest(&self) -> Result<(), DownloadError> {
        if self.expected_hash.is_some() && self.hash_algorithm == HashAlgorithm::None {
            return Err(DownloadError::UnsupportedAlgorithm(HashAlgorithm::None));
        }
        Ok(())
    }
}
