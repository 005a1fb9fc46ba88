//! SureFetch CLI - resilient single-file downloads from the command line.
//!
//! This binary is a thin host around the `surefetch` library: it maps flags
//! onto per-call options, renders progress, and turns the outcome into an
//! exit code (0 success, 1 failure, 130 cancelled).

mod commands;
mod display;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use console::style;
use surefetch::logging::{self, LoggingConfig, LoggingGuard};

use commands::get::GetArgs;
use commands::verify::VerifyArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(
    name = "surefetch",
    version,
    about = "Resilient, resumable, integrity-verified HTTP downloads"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to daily-rolling files in this directory
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a URL to a file with retry, resume and verification
    Get(GetArgs),

    /// Check a local file against an expected digest
    Verify(VerifyArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = init_logging(cli.verbose, cli.log_dir).and_then(|_guard| match cli.command {
        Commands::Get(args) => commands::get::run(args),
        Commands::Verify(args) => commands::verify::run(args),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Cancelled) => ExitCode::from(CliError::Cancelled.exit_code()),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Console logging goes to stderr, below the progress bar's level of detail
/// unless `-v` is given.
fn init_logging(verbose: u8, log_dir: Option<PathBuf>) -> Result<LoggingGuard, CliError> {
    let mut config = LoggingConfig::default()
        .with_level(log_level(verbose))
        .with_ansi(console::colors_enabled_stderr());
    if let Some(dir) = log_dir {
        config = config.with_log_dir(dir);
    }
    logging::init(&config).map_err(|e| CliError::Logging(e.to_string()))
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}
