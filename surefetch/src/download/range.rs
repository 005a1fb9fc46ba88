//! Resume negotiation.
//!
//! Decides whether an attempt resumes from an existing partial file, builds
//! the `Range` header, and classifies the server's answer. Nothing in here
//! touches the network, so every rule is tested against synthetic headers.
//!
//! # Response handling
//!
//! | Status | Outcome |
//! |--------|---------|
//! | 206 starting at the requested offset | [`RangeOutcome::Resumed`] |
//! | 206 starting anywhere else | [`RangeOutcome::OffsetMismatch`] |
//! | 2xx (range ignored or not requested) | [`RangeOutcome::Restarted`] |
//! | 416 | [`RangeOutcome::RangeNotSatisfiable`] |
//! | 5xx, 408, 429 | [`RangeOutcome::Transient`] |
//! | anything else | [`RangeOutcome::NonRetryable`] |

use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RETRY_AFTER};
use reqwest::StatusCode;

use super::partial::PartialInfo;
use crate::config::ResolvedOptions;
use crate::error::is_transient_status;

/// Why an attempt starts from byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    /// No partial file on disk, or it is empty.
    NoPartial,
    /// Resume is turned off for this call.
    ResumeDisabled,
    /// The partial file is smaller than the resume threshold.
    BelowThreshold { size: u64 },
    /// The partial file is older than the staleness bound.
    Stale { age: Duration },
}

/// Whether the next attempt starts fresh or resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Fresh { reason: FreshReason },
    Resume { offset: u64 },
}

impl ResumeDecision {
    /// Byte offset the attempt starts writing at.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Fresh { .. } => 0,
            Self::Resume { offset } => *offset,
        }
    }

    /// Whether an existing partial file must be thrown away first.
    pub fn discards_partial(&self) -> bool {
        matches!(
            self,
            Self::Fresh {
                reason: FreshReason::ResumeDisabled
                    | FreshReason::BelowThreshold { .. }
                    | FreshReason::Stale { .. }
            }
        )
    }
}

/// Parsed `Content-Range` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes <start>-<end>/<total>` or `bytes <start>-<end>/*`.
    Bytes {
        start: u64,
        end: u64,
        total: Option<u64>,
    },
    /// `bytes */<total>`, sent with 416.
    Unsatisfied { complete_length: u64 },
}

/// How a response relates to the range that was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Body continues the partial file at `offset`.
    Resumed { offset: u64, total: Option<u64> },
    /// Body is the whole resource; write from byte 0.
    Restarted { total: Option<u64> },
    /// The requested range lies outside the resource.
    RangeNotSatisfiable { complete_length: Option<u64> },
    /// Worth retrying after a backoff wait.
    Transient {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// Give up without retrying.
    NonRetryable { status: u16 },
    /// Partial content that does not start where the partial file ends.
    OffsetMismatch { expected: u64, actual: Option<u64> },
}

/// Resume eligibility rules for one download call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNegotiator {
    allow_resume: bool,
    resume_threshold: u64,
    max_age: Duration,
}

impl RangeNegotiator {
    pub fn new(allow_resume: bool, resume_threshold: u64, max_age: Duration) -> Self {
        Self {
            allow_resume,
            resume_threshold,
            max_age,
        }
    }

    pub fn from_options(options: &ResolvedOptions) -> Self {
        Self::new(
            options.allow_resume,
            options.resume_threshold,
            options.partial_file_max_age,
        )
    }

    /// Decide how the next attempt starts.
    ///
    /// Resume requires all of: resume enabled, a non-empty partial file,
    /// size at least the threshold, and age within the staleness bound.
    pub fn decide(&self, partial: Option<PartialInfo>) -> ResumeDecision {
        let fresh = |reason| ResumeDecision::Fresh { reason };

        let Some(info) = partial.filter(|p| p.size > 0) else {
            return fresh(FreshReason::NoPartial);
        };
        if !self.allow_resume {
            return fresh(FreshReason::ResumeDisabled);
        }
        if info.age > self.max_age {
            return fresh(FreshReason::Stale { age: info.age });
        }
        if info.size < self.resume_threshold {
            return fresh(FreshReason::BelowThreshold { size: info.size });
        }

        ResumeDecision::Resume { offset: info.size }
    }

    /// `Range` header value requesting everything from `offset` onward.
    pub fn range_header(offset: u64) -> String {
        format!("bytes={}-", offset)
    }

    /// Classify a response to a request that asked for bytes from
    /// `requested_offset` (0 when no range was sent).
    pub fn classify(requested_offset: u64, status: StatusCode, headers: &HeaderMap) -> RangeOutcome {
        let content_range = header_str(headers, CONTENT_RANGE.as_str()).and_then(parse_content_range);

        if status == StatusCode::PARTIAL_CONTENT {
            return match content_range {
                Some(ContentRange::Bytes { start, end, total }) if start == requested_offset => {
                    RangeOutcome::Resumed {
                        offset: start,
                        total: total.or_else(|| end.checked_add(1)),
                    }
                }
                Some(ContentRange::Bytes { start, .. }) => RangeOutcome::OffsetMismatch {
                    expected: requested_offset,
                    actual: Some(start),
                },
                _ => RangeOutcome::OffsetMismatch {
                    expected: requested_offset,
                    actual: None,
                },
            };
        }

        if status.is_success() {
            return RangeOutcome::Restarted {
                total: content_length(headers),
            };
        }

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let complete_length = match content_range {
                Some(ContentRange::Unsatisfied { complete_length }) => Some(complete_length),
                Some(ContentRange::Bytes { total, .. }) => total,
                None => None,
            };
            return RangeOutcome::RangeNotSatisfiable { complete_length };
        }

        if is_transient_status(status.as_u16()) {
            return RangeOutcome::Transient {
                status: status.as_u16(),
                retry_after: retry_after(headers),
            };
        }

        RangeOutcome::NonRetryable {
            status: status.as_u16(),
        }
    }
}

/// Parse a `Content-Range` header value.
///
/// Accepts `bytes start-end/total`, `bytes start-end/*` and `bytes */total`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = total.trim();

    if range.trim() == "*" {
        return Some(ContentRange::Unsatisfied {
            complete_length: total.parse().ok()?,
        });
    }

    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };

    Some(ContentRange::Bytes { start, end, total })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH.as_str()).and_then(|s| s.trim().parse().ok())
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
