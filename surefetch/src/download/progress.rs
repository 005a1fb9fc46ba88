//! Progress snapshots and throttled delivery to caller sinks.
//!
//! The manager feeds every written chunk into a [`ProgressReporter`], which
//! keeps a rolling window of `(instant, bytes)` samples to derive speed and
//! ETA. Byte updates are throttled to one emission per update interval;
//! phase transitions and terminal events bypass the throttle so a consumer
//! never misses a state change.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};

/// Stage of a download as observed by progress consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initializing,
    Connecting,
    Downloading,
    Retrying,
    Verifying,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    /// Whether no further events follow this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Downloading => "downloading",
            Self::Retrying => "retrying",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Snapshot delivered to a [`ProgressSink`].
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EnhancedDownloadProgress {
    pub message: String,
    /// `None` while the total size is unknown.
    pub percent: Option<f64>,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_second: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub eta: Option<Duration>,
    /// Retry number in progress, 0 on the first attempt.
    pub retry_attempt: u32,
    pub is_resuming: bool,
    pub phase: Phase,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl EnhancedDownloadProgress {
    /// Transfer rate formatted for display, e.g. `1.5 MB/s`.
    pub fn speed_string(&self) -> String {
        format!("{}/s", format_bytes(self.bytes_per_second))
    }

    /// Remaining time formatted for display, e.g. `1h 02m 03s`, or `--`.
    pub fn eta_string(&self) -> String {
        let Some(eta) = self.eta else {
            return "--".to_string();
        };
        let secs = eta.as_secs();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if h > 0 {
            format!("{}h {:02}m {:02}s", h, m, s)
        } else if m > 0 {
            format!("{}m {:02}s", m, s)
        } else {
            format!("{}s", s)
        }
    }
}

fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Receiver of progress snapshots.
///
/// Implementations must not block; they run on the download task.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, progress: &EnhancedDownloadProgress);
}

impl ProgressSink for mpsc::UnboundedSender<EnhancedDownloadProgress> {
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        // A dropped receiver only means nobody is listening
        let _ = self.send(progress.clone());
    }
}

impl ProgressSink for watch::Sender<EnhancedDownloadProgress> {
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        self.send_replace(progress.clone());
    }
}

/// Adapts a closure into a [`ProgressSink`].
pub struct CallbackSink<F>(F);

impl<F> CallbackSink<F>
where
    F: Fn(&EnhancedDownloadProgress) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> ProgressSink for CallbackSink<F>
where
    F: Fn(&EnhancedDownloadProgress) + Send + Sync,
{
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        (self.0)(progress)
    }
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _progress: &EnhancedDownloadProgress) {}
}

/// Speed sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Throttling reporter for one download call.
///
/// Holds the current snapshot; [`report`](Self::report) emits it at most
/// once per interval and [`force`](Self::force) emits unconditionally.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    interval: Duration,
    max_samples: usize,
    samples: VecDeque<Sample>,
    last_emit: Option<Instant>,
    state: EnhancedDownloadProgress,
}

impl<'a> ProgressReporter<'a> {
    /// Create a reporter. `max_samples` below 2 is raised to 2.
    pub fn new(sink: &'a dyn ProgressSink, interval: Duration, max_samples: usize) -> Self {
        let max_samples = max_samples.max(2);
        Self {
            sink,
            interval,
            max_samples,
            samples: VecDeque::with_capacity(max_samples),
            last_emit: None,
            state: EnhancedDownloadProgress::default(),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> &EnhancedDownloadProgress {
        &self.state
    }

    /// Move to `phase` and emit immediately.
    pub fn transition(&mut self, phase: Phase, message: impl Into<String>) {
        self.state.phase = phase;
        self.state.message = message.into();
        self.force();
    }

    /// Reset byte counters for a new physical attempt.
    ///
    /// Counting starts at `offset` (the resume position) rather than zero.
    pub fn begin_attempt(&mut self, offset: u64, total: Option<u64>, resuming: bool) {
        self.samples.clear();
        self.state.bytes_downloaded = offset;
        self.state.total_bytes = total;
        self.state.is_resuming = resuming;
        self.state.bytes_per_second = 0.0;
        self.state.eta = None;
        self.state.error = None;
        self.state.percent = percent(offset, total);
        self.push_sample(Instant::now(), offset);
    }

    /// Set the retry number shown in subsequent snapshots.
    pub fn set_retry_attempt(&mut self, attempt: u32) {
        self.state.retry_attempt = attempt;
    }

    /// Record the running byte count and emit if the throttle allows.
    pub fn record(&mut self, bytes_downloaded: u64) {
        self.record_at(bytes_downloaded, Instant::now());
    }

    /// Emit the current snapshot if the throttle interval has elapsed.
    pub fn report(&mut self) {
        self.report_at(Instant::now());
    }

    /// Emit the current snapshot regardless of the throttle.
    pub fn force(&mut self) {
        self.last_emit = Some(Instant::now());
        self.sink.emit(&self.state);
    }

    /// Emit the terminal success event.
    pub fn complete(&mut self, message: impl Into<String>) {
        self.state.is_complete = true;
        self.state.error = None;
        self.state.eta = Some(Duration::ZERO);
        if let Some(total) = self.state.total_bytes {
            self.state.percent = percent(self.state.bytes_downloaded.max(total), Some(total));
        }
        self.transition(Phase::Complete, message);
    }

    /// Emit the terminal failure event.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.state.is_complete = false;
        self.state.error = Some(error.clone());
        self.transition(Phase::Failed, error);
    }

    /// Emit the terminal cancellation event.
    pub fn cancel(&mut self) {
        self.state.is_complete = false;
        self.transition(Phase::Cancelled, "Download cancelled");
    }

    fn record_at(&mut self, bytes_downloaded: u64, now: Instant) {
        let bytes = bytes_downloaded.max(self.state.bytes_downloaded);
        self.push_sample(now, bytes);
        self.state.bytes_downloaded = bytes;
        self.state.percent = percent(bytes, self.state.total_bytes);
        self.state.bytes_per_second = self.window_speed();
        self.state.eta = eta(bytes, self.state.total_bytes, self.state.bytes_per_second);
        self.report_at(now);
    }

    fn report_at(&mut self, now: Instant) {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
            self.sink.emit(&self.state);
        }
    }

    fn push_sample(&mut self, at: Instant, bytes: u64) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at, bytes });
    }

    /// Bytes per second across the sample window, keeping the previous
    /// value when the window spans no measurable time.
    fn window_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return self.state.bytes_per_second;
        }
        last.bytes.saturating_sub(first.bytes) as f64 / elapsed
    }
}

fn percent(bytes: u64, total: Option<u64>) -> Option<f64> {
    total.map(|t| {
        if t == 0 {
            100.0
        } else {
            (bytes as f64 * 100.0 / t as f64).min(100.0)
        }
    })
}

fn eta(bytes: u64, total: Option<u64>, speed: f64) -> Option<Duration> {
    let total = total?;
    if speed <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(bytes) as f64;
    // Absurd totals from the server overflow Duration
    Duration::try_from_secs_f64(remaining / speed).ok()
}
