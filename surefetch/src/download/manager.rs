//! Retry, resume and verify state machine for one file.
//!
//! ```text
//! Initializing ─► Connecting ─► Downloading ─┬─► Verifying ─► Complete
//!                    ▲                       │
//!                    │     transient error   ▼
//!                    └──────── Retrying ◄────┤
//!                                            └─► Failed / Cancelled
//! ```
//!
//! Each call runs a bounded loop over attempts. An attempt inspects the
//! partial file, lets the [`RangeNegotiator`] pick fresh or resume, sends
//! the request and streams the body into the partial file. Transient
//! failures wait out a backoff delay and loop; everything else ends the
//! call. On success the partial file is promoted to the destination and
//! optionally verified.

use std::path::Path;
use std::pin::pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE, USER_AGENT};
use reqwest::{Client, Response, Url};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checksum::ChecksumVerifier;
use super::partial::PartialFile;
use super::progress::{NullSink, Phase, ProgressReporter, ProgressSink};
use super::range::{FreshReason, RangeNegotiator, RangeOutcome, ResumeDecision};
use super::result::DownloadResult;
use super::state::RetryState;
use crate::config::{DownloadConfiguration, DownloadOptions, ResolvedOptions};
use crate::error::DownloadError;

static NULL_SINK: NullSink = NullSink;

/// Single-file HTTP download engine.
///
/// Holds one HTTP client and the engine-wide defaults. Independent
/// destinations can be downloaded concurrently through the same manager;
/// two calls targeting the same destination must be serialized by the caller.
///
/// # Example
///
/// ```ignore
/// let manager = DownloadManager::new()?;
/// let options = DownloadOptions::new()
///     .with_expected_hash("9e107d9d372bb6826bd81d3542a419d6", HashAlgorithm::Md5);
///
/// let result = manager
///     .download("https://example.com/release.zip", Path::new("release.zip"), Some(&options), None)
///     .await?;
/// assert!(result.success);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadManager {
    client: Client,
    config: DownloadConfiguration,
    verifier: ChecksumVerifier,
}

impl DownloadManager {
    /// Create a manager with default configuration.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_config(DownloadConfiguration::default())
    }

    /// Create a manager with the given engine-wide defaults.
    pub fn with_config(config: DownloadConfiguration) -> Result<Self, DownloadError> {
        // Timeouts are applied per request so each attempt gets its own budget
        let client = Client::builder()
            .build()
            .map_err(DownloadError::ClientInit)?;
        Ok(Self::with_client(client, config))
    }

    /// Create a manager around an existing client.
    pub fn with_client(client: Client, config: DownloadConfiguration) -> Self {
        Self {
            client,
            config,
            verifier: ChecksumVerifier::new(),
        }
    }

    /// Engine-wide defaults.
    pub fn config(&self) -> &DownloadConfiguration {
        &self.config
    }

    /// Download `url` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns `Err` only for precondition violations detected before any
    /// network activity: an invalid URL or header, an expected digest with no
    /// usable algorithm, a destination that does not name a file, or a
    /// destination directory that cannot be written.
    /// Transport, HTTP and integrity failures are reported through
    /// [`DownloadResult`].
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        options: Option<&DownloadOptions>,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<DownloadResult, DownloadError> {
        let cancel = CancellationToken::new();
        self.download_with_cancel(url, destination, options, sink, &cancel)
            .await
    }

    /// Download with cooperative cancellation.
    ///
    /// Cancelling `cancel` aborts the in-flight read or backoff wait, keeps
    /// the partial file for a later resume, and yields a result whose
    /// outcome is [`Cancelled`](super::DownloadOutcome::Cancelled).
    pub async fn download_with_cancel(
        &self,
        url: &str,
        destination: &Path,
        options: Option<&DownloadOptions>,
        sink: Option<&dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        let started = Instant::now();
        let url = parse_url(url)?;
        let resolved = self.config.resolve(options);
        resolved.check_digest()?;
        let headers = build_headers(&resolved)?;
        let partial = PartialFile::for_destination(destination)?;
        partial.ensure_writable().await?;

        let mut reporter = ProgressReporter::new(
            sink.unwrap_or(&NULL_SINK),
            resolved.progress_update_interval,
            resolved.speed_calculation_samples,
        );
        reporter.transition(Phase::Initializing, "Preparing download");

        let mut transfer = Transfer {
            client: &self.client,
            verifier: &self.verifier,
            url: url.as_str(),
            destination,
            partial,
            negotiator: RangeNegotiator::from_options(&resolved),
            retry: RetryState::new(resolved.max_retries),
            options: resolved,
            headers,
            cancel,
            reporter,
            started,
        };

        if let Some(result) = transfer.reuse_destination().await {
            return Ok(result);
        }
        Ok(transfer.run().await)
    }
}

/// Why an attempt ended without a complete body.
enum AttemptError {
    Cancelled,
    Failed {
        error: DownloadError,
        retry_after: Option<Duration>,
    },
}

impl From<DownloadError> for AttemptError {
    fn from(error: DownloadError) -> Self {
        Self::Failed {
            error,
            retry_after: None,
        }
    }
}

/// State of one download call.
struct Transfer<'a> {
    client: &'a Client,
    verifier: &'a ChecksumVerifier,
    url: &'a str,
    destination: &'a Path,
    partial: PartialFile,
    negotiator: RangeNegotiator,
    retry: RetryState,
    options: ResolvedOptions,
    headers: HeaderMap,
    cancel: &'a CancellationToken,
    reporter: ProgressReporter<'a>,
    started: Instant,
}

impl<'a> Transfer<'a> {
    async fn run(mut self) -> DownloadResult {
        let cancel = self.cancel;
        info!(
            url = %self.url,
            destination = %self.destination.display(),
            max_retries = self.options.max_retries,
            "Starting download"
        );

        let bytes = loop {
            let (error, retry_after) = match self.attempt().await {
                Ok(bytes) => break bytes,
                Err(AttemptError::Cancelled) => return self.cancelled().await,
                Err(AttemptError::Failed { error, retry_after }) => (error, retry_after),
            };

            if !error.is_transient() {
                warn!(url = %self.url, error = %error, "Download failed, not retrying");
                return self.failed(error).await;
            }

            let Some(delay) = self.retry.next_retry(&self.options.backoff, retry_after) else {
                warn!(
                    url = %self.url,
                    retries = self.retry.attempt,
                    error = %error,
                    "Download failed, retries exhausted"
                );
                return self.failed(error).await;
            };

            warn!(
                url = %self.url,
                attempt = self.retry.attempt,
                max_retries = self.options.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            self.reporter.set_retry_attempt(self.retry.attempt);
            self.reporter.transition(
                Phase::Retrying,
                format!(
                    "{}; retry {}/{} in {:.1}s",
                    error,
                    self.retry.attempt,
                    self.options.max_retries,
                    delay.as_secs_f64()
                ),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled().await,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.finish(bytes).await
    }

    /// One connect + stream pass. Returns the bytes in the partial file.
    async fn attempt(&mut self) -> Result<u64, AttemptError> {
        if self.cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        let mut decision = self.negotiator.decide(self.partial.inspect().await);
        if decision.discards_partial() {
            debug!(path = %self.partial.path().display(), decision = ?decision, "Discarding partial file");
            self.partial.discard().await?;
        }

        let mut restarted = false;
        loop {
            let offset = decision.offset();
            let message = match decision {
                ResumeDecision::Resume { offset } => format!("Connecting (resume at byte {})", offset),
                ResumeDecision::Fresh { .. } => "Connecting".to_string(),
            };
            self.reporter.transition(Phase::Connecting, message);

            let response = self.send(offset).await?;
            let status = response.status();

            match RangeNegotiator::classify(offset, status, response.headers()) {
                RangeOutcome::Resumed { offset, total } => {
                    return self.stream(response, offset, total).await;
                }
                RangeOutcome::Restarted { total } => {
                    if offset > 0 {
                        warn!(url = %self.url, offset, "Server ignored range request, restarting from byte 0");
                    }
                    return self.stream(response, 0, total).await;
                }
                RangeOutcome::RangeNotSatisfiable { complete_length } => {
                    if offset > 0 && complete_length == Some(offset) {
                        info!(url = %self.url, bytes = offset, "Partial file already holds the whole resource");
                        self.retry.mark_resumed();
                        self.reporter.begin_attempt(offset, Some(offset), true);
                        return Ok(offset);
                    }
                    if offset == 0 || restarted {
                        return Err(self.http_error(status.as_u16()).into());
                    }
                    warn!(url = %self.url, offset, ?complete_length, "Range not satisfiable, restarting fresh");
                    self.partial.discard().await?;
                    decision = ResumeDecision::Fresh {
                        reason: FreshReason::NoPartial,
                    };
                    restarted = true;
                }
                RangeOutcome::Transient { status, retry_after } => {
                    return Err(AttemptError::Failed {
                        error: self.http_error(status),
                        retry_after,
                    });
                }
                RangeOutcome::NonRetryable { status } => {
                    return Err(self.http_error(status).into());
                }
                RangeOutcome::OffsetMismatch { expected, actual } => {
                    warn!(url = %self.url, expected, ?actual, "Partial content at wrong offset, discarding partial file");
                    self.partial.discard().await?;
                    return Err(DownloadError::RangeMismatch { expected, actual }.into());
                }
            }
        }
    }

    async fn send(&self, offset: u64) -> Result<Response, AttemptError> {
        let mut request = self
            .client
            .get(self.url)
            .timeout(self.options.timeout)
            .headers(self.headers.clone());
        if offset > 0 {
            request = request.header(RANGE, RangeNegotiator::range_header(offset));
        }

        debug!(url = %self.url, offset, "Sending request");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AttemptError::Cancelled),
            response = request.send() => response.map_err(|e| AttemptError::from(self.transport_error(e))),
        }
    }

    /// Write the body into the partial file starting at `offset`.
    async fn stream(
        &mut self,
        response: Response,
        offset: u64,
        total: Option<u64>,
    ) -> Result<u64, AttemptError> {
        let file = if offset > 0 {
            self.retry.mark_resumed();
            self.partial.open_append().await?
        } else {
            self.partial.open_fresh().await?
        };
        let mut writer = BufWriter::with_capacity(self.options.buffer_size, file);

        self.reporter.begin_attempt(offset, total, offset > 0);
        let message = if offset > 0 {
            format!("Resuming at byte {}", offset)
        } else {
            "Downloading".to_string()
        };
        self.reporter.transition(Phase::Downloading, message);
        info!(url = %self.url, offset, total = ?total, "Receiving body");

        let cancel = self.cancel;
        let mut written = offset;
        let mut body = pin!(response.bytes_stream());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flush_quietly(&mut writer).await;
                    return Err(AttemptError::Cancelled);
                }
                next = body.next() => next,
            };

            let chunk: Bytes = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    flush_quietly(&mut writer).await;
                    return Err(self.transport_error(e).into());
                }
            };

            for piece in chunk.chunks(self.options.buffer_size) {
                if let Err(source) = writer.write_all(piece).await {
                    flush_quietly(&mut writer).await;
                    return Err(self.write_error(source).into());
                }
                written += piece.len() as u64;
                self.reporter.record(written);
            }
        }

        writer
            .flush()
            .await
            .map_err(|source| self.write_error(source))?;

        if let Some(expected) = total {
            if written < expected {
                return Err(DownloadError::IncompleteBody {
                    expected,
                    received: written,
                }
                .into());
            }
        }

        debug!(url = %self.url, bytes = written, "Body complete");
        Ok(written)
    }

    /// Promote, verify and report success.
    async fn finish(mut self, bytes: u64) -> DownloadResult {
        if let Err(error) = self.partial.promote(self.destination).await {
            return self.failed(error).await;
        }

        let mut actual_hash = None;
        let mut hash_verified = None;

        if self.options.computes_hash() {
            self.reporter.transition(Phase::Verifying, "Verifying checksum");
            let algorithm = self.options.hash_algorithm;

            let checked = match self.options.expected_hash.as_deref() {
                Some(expected) => self
                    .verifier
                    .verify(self.destination, expected, algorithm)
                    .await
                    .map(|v| (v.actual_hash, Some(v.verified))),
                None => self
                    .verifier
                    .compute(self.destination, algorithm)
                    .await
                    .map(|hash| (hash, None)),
            };

            match checked {
                Ok((actual, Some(false))) => return self.integrity_failure(actual).await,
                Ok((actual, verified)) => {
                    actual_hash = Some(actual);
                    hash_verified = verified;
                }
                Err(error) => return self.failed(error).await,
            }
        }

        self.cleanup_partial().await;

        info!(
            url = %self.url,
            destination = %self.destination.display(),
            bytes,
            retries = self.retry.attempt,
            resumed = self.retry.was_resumed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Download complete"
        );
        self.reporter.complete("Download complete");

        DownloadResult::completed(self.destination, bytes, &self.retry, self.started.elapsed())
            .with_hash(actual_hash, hash_verified)
    }

    /// Idempotent fast path: the destination already matches the expected digest.
    async fn reuse_destination(&mut self) -> Option<DownloadResult> {
        if !self.options.reuse_verified_destination || !self.options.verifies() {
            return None;
        }
        let expected = self.options.expected_hash.as_deref()?;
        let size = tokio::fs::metadata(self.destination)
            .await
            .ok()
            .filter(|m| m.is_file())?
            .len();

        let verification = match self
            .verifier
            .verify(self.destination, expected, self.options.hash_algorithm)
            .await
        {
            Ok(v) if v.verified => v,
            Ok(_) => {
                debug!(destination = %self.destination.display(), "Existing destination does not match, downloading");
                return None;
            }
            Err(error) => {
                debug!(destination = %self.destination.display(), error = %error, "Could not check existing destination");
                return None;
            }
        };

        info!(destination = %self.destination.display(), "Destination already verified, skipping download");
        self.cleanup_partial().await;

        self.reporter.begin_attempt(size, Some(size), false);
        self.reporter.complete("Destination already verified");

        Some(
            DownloadResult::completed(self.destination, size, &self.retry, self.started.elapsed())
                .with_hash(Some(verification.actual_hash), Some(true)),
        )
    }

    async fn integrity_failure(self, actual: String) -> DownloadResult {
        let expected = self
            .options
            .expected_hash
            .as_deref()
            .map(super::checksum::normalize_digest)
            .unwrap_or_default();

        if self.options.delete_corrupted_files {
            if let Err(e) = tokio::fs::remove_file(self.destination).await {
                warn!(destination = %self.destination.display(), error = %e, "Failed to remove corrupted file");
            } else {
                debug!(destination = %self.destination.display(), "Removed corrupted file");
            }
        }

        let filename = self
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        warn!(
            destination = %self.destination.display(),
            expected = %expected,
            actual = %actual,
            "Checksum mismatch"
        );

        let error = DownloadError::ChecksumMismatch {
            filename,
            expected,
            actual: actual.clone(),
        };
        self.failed(error).await.with_hash(Some(actual), Some(false))
    }

    async fn failed(mut self, error: DownloadError) -> DownloadResult {
        // An empty partial file left by a failed first request is not worth keeping
        if matches!(self.partial.inspect().await, Some(info) if info.size == 0) {
            if let Err(error) = self.partial.discard().await {
                warn!(path = %self.partial.path().display(), error = %error, "Failed to remove empty partial file");
            }
        }

        self.reporter.fail(error.to_string());
        let bytes = self.reporter.snapshot().bytes_downloaded;
        DownloadResult::failed(self.destination, bytes, &self.retry, self.started.elapsed(), error)
    }

    async fn cancelled(mut self) -> DownloadResult {
        let bytes = self
            .partial
            .inspect()
            .await
            .map(|info| info.size)
            .unwrap_or_else(|| self.reporter.snapshot().bytes_downloaded);

        info!(
            url = %self.url,
            partial = %self.partial.path().display(),
            bytes,
            "Download cancelled, partial file kept"
        );
        self.reporter.cancel();
        DownloadResult::cancelled(self.destination, bytes, &self.retry, self.started.elapsed())
    }

    async fn cleanup_partial(&self) {
        if !self.options.cleanup_partial_on_success {
            return;
        }
        if let Err(error) = self.partial.discard().await {
            warn!(path = %self.partial.path().display(), error = %error, "Failed to remove partial file");
        }
    }

    fn http_error(&self, status: u16) -> DownloadError {
        DownloadError::Http {
            url: self.url.to_string(),
            status,
        }
    }

    fn transport_error(&self, source: reqwest::Error) -> DownloadError {
        DownloadError::from_reqwest(self.url, self.options.timeout.as_secs(), source)
    }

    fn write_error(&self, source: std::io::Error) -> DownloadError {
        DownloadError::WriteFailed {
            path: self.partial.path().to_path_buf(),
            source,
        }
    }
}

async fn flush_quietly(writer: &mut BufWriter<File>) {
    if let Err(error) = writer.flush().await {
        warn!(error = %error, "Failed to flush partial file");
    }
}

fn parse_url(url: &str) -> Result<Url, DownloadError> {
    let invalid = |reason: String| DownloadError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(parsed)
}

/// User-Agent plus custom headers. Later entries replace earlier ones with
/// the same name; `Range` is reserved for resume negotiation.
fn build_headers(options: &ResolvedOptions) -> Result<HeaderMap, DownloadError> {
    let invalid = |name: &str, reason: String| DownloadError::InvalidHeader {
        name: name.to_string(),
        reason,
    };

    let mut headers = HeaderMap::new();
    let agent = HeaderValue::from_str(&options.user_agent)
        .map_err(|e| invalid(USER_AGENT.as_str(), e.to_string()))?;
    headers.insert(USER_AGENT, agent);

    for (name, value) in &options.custom_headers {
        let header_name =
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| invalid(name, e.to_string()))?;
        let header_value =
            HeaderValue::from_str(value.trim()).map_err(|e| invalid(name, e.to_string()))?;
        headers.insert(header_name, header_value);
    }

    headers.remove(RANGE);
    Ok(headers)
}
