//! Terminal and JSON rendering of download progress and results.

use std::path::Path;
use std::time::Duration;

use console::style;
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use serde_json::json;
use surefetch::{DownloadOutcome, DownloadResult, EnhancedDownloadProgress, Phase, ProgressSink};

const BAR_TEMPLATE: &str = "{spinner:.blue} {prefix:>11.cyan.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} {msg}";

const SPINNER_TEMPLATE: &str = "{spinner:.blue} {prefix:>11.cyan.bold} [{elapsed_precise}] {bytes} {msg}";

const TICK: &str = "⠁⠂⠄⡀⢀⠠⠐⠈ ";

const PB_CHARS: &str = "█▓▒░  ";

fn bar_style(template: &str) -> ProgressStyle {
    match ProgressStyle::with_template(template) {
        Ok(style) => style.tick_chars(TICK).progress_chars(PB_CHARS),
        Err(_) => ProgressStyle::default_bar(),
    }
}

/// Progress bar on stderr.
///
/// Starts as a spinner and switches to a bar once the response announces
/// its length.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner().with_style(bar_style(SPINNER_TEMPLATE));
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Remove the bar before the summary is printed.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for BarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarSink {
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        if let Some(total) = progress.total_bytes {
            if self.bar.length() != Some(total) {
                self.bar.set_style(bar_style(BAR_TEMPLATE));
                self.bar.set_length(total);
            }
        }
        self.bar.set_position(progress.bytes_downloaded);
        self.bar.set_prefix(progress.phase.to_string());

        let message = match progress.phase {
            Phase::Downloading => format!(
                "{} ETA {}",
                progress.speed_string(),
                progress.eta_string()
            ),
            _ => progress.message.clone(),
        };
        self.bar.set_message(message);

        if progress.phase == Phase::Retrying {
            self.bar
                .println(format!("{} {}", style("retry").yellow().bold(), progress.message));
        }
    }
}

/// One JSON object per progress event on stdout.
pub struct JsonLinesSink;

impl ProgressSink for JsonLinesSink {
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        if let Ok(line) = serde_json::to_string(progress) {
            println!("{}", line);
        }
    }
}

fn outcome_name(outcome: DownloadOutcome) -> &'static str {
    match outcome {
        DownloadOutcome::Completed => "completed",
        DownloadOutcome::Failed => "failed",
        DownloadOutcome::Cancelled => "cancelled",
    }
}

/// Final result as a JSON object.
pub fn result_json(result: &DownloadResult) -> serde_json::Value {
    json!({
        "event": "result",
        "outcome": outcome_name(result.outcome),
        "success": result.success,
        "file_path": result.file_path,
        "bytes_downloaded": result.bytes_downloaded,
        "actual_hash": result.actual_hash,
        "hash_verified": result.hash_verified,
        "retry_attempts": result.retry_attempts,
        "was_resumed": result.was_resumed,
        "duration_secs": result.duration.as_secs_f64(),
        "error": result.error_message,
    })
}

/// Human-readable summary on stdout.
pub fn print_summary(result: &DownloadResult, partial: &Path) {
    match result.outcome {
        DownloadOutcome::Completed => {
            let mut notes = Vec::new();
            if result.was_resumed {
                notes.push("resumed".to_string());
            }
            if result.retry_attempts > 0 {
                notes.push(format!("{} retries", result.retry_attempts));
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            };

            println!(
                "{} Downloaded {} to {} in {}{}",
                style("✓").green().bold(),
                HumanBytes(result.bytes_downloaded),
                result.file_path.display(),
                HumanDuration(result.duration),
                notes
            );
            if let Some(hash) = &result.actual_hash {
                let status = match result.hash_verified {
                    Some(true) => style("verified").green().to_string(),
                    _ => style("not checked").dim().to_string(),
                };
                println!("  digest: {} ({})", hash, status);
            }
        }
        DownloadOutcome::Failed => {
            println!(
                "{} {} after {} retries",
                style("✗").red().bold(),
                result.error_message.as_deref().unwrap_or("Download failed"),
                result.retry_attempts
            );
            if result.hash_verified == Some(false) {
                if let Some(hash) = &result.actual_hash {
                    println!("  actual digest: {}", hash);
                }
            }
        }
        DownloadOutcome::Cancelled => {
            println!(
                "{} Cancelled after {}; partial file kept at {}",
                style("!").yellow().bold(),
                HumanBytes(result.bytes_downloaded),
                partial.display()
            );
        }
    }
}
