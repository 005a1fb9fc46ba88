//! CLI error type and exit-code mapping.

use std::fmt;

use surefetch::{ConfigError, DownloadError};

/// Exit code for a cancelled run (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

/// Errors surfaced to the user by the CLI.
#[derive(Debug)]
pub enum CliError {
    /// Invalid arguments or configuration.
    Config(String),
    /// Logging could not be initialized.
    Logging(String),
    /// The async runtime could not be started.
    Runtime(String),
    /// The engine rejected the request before any transfer.
    Download(DownloadError),
    /// The transfer ran and failed.
    Failed(String),
    /// A file did not match its expected digest.
    Mismatch { expected: String, actual: String },
    /// The user interrupted the transfer.
    Cancelled,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Cancelled => EXIT_CANCELLED,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Logging(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Runtime(msg) => write!(f, "Failed to start runtime: {}", msg),
            CliError::Download(e) => write!(f, "{}", e),
            CliError::Failed(msg) => write!(f, "Download failed: {}", msg),
            CliError::Mismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
            }
            CliError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<DownloadError> for CliError {
    fn from(e: DownloadError) -> Self {
        CliError::Download(e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}
