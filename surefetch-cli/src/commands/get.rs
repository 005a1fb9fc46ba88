//! Get command - download one URL to a file.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use surefetch::download::{DownloadManager, PartialFile};
use surefetch::{DownloadOptions, DownloadOutcome, DownloadResult};
use tokio_util::sync::CancellationToken;

use super::common::{load_config, parse_header, resolve_algorithm, runtime, AlgorithmArg};
use crate::display::{print_summary, result_json, BarSink, JsonLinesSink};
use crate::error::CliError;

/// Arguments for the get command.
#[derive(Debug, Args)]
pub struct GetArgs {
    /// URL to download (http or https)
    pub url: String,

    /// Destination file
    pub dest: PathBuf,

    /// Expected digest of the finished file (hex)
    #[arg(long, value_name = "HEX")]
    pub hash: Option<String>,

    /// Digest algorithm (inferred from the digest length when omitted)
    #[arg(long, value_enum)]
    pub algorithm: Option<AlgorithmArg>,

    /// Retries after the first attempt
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "N")]
    pub timeout_secs: Option<u64>,

    /// Ignore any partial file and start from byte 0
    #[arg(long)]
    pub no_resume: bool,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Print progress and the result as JSON lines on stdout
    #[arg(long)]
    pub json: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Run the get command.
pub fn run(args: GetArgs) -> Result<(), CliError> {
    let config = load_config(args.config.as_deref())?;
    let options = build_options(&args)?;
    let manager = DownloadManager::with_config(config)?;
    let partial = PartialFile::for_destination(&args.dest)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, stopping...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let runtime = runtime()?;

    let result = if args.json {
        let sink = JsonLinesSink;
        runtime.block_on(manager.download_with_cancel(
            &args.url,
            &args.dest,
            Some(&options),
            Some(&sink),
            &cancel,
        ))?
    } else {
        let sink = BarSink::new();
        let result = runtime.block_on(manager.download_with_cancel(
            &args.url,
            &args.dest,
            Some(&options),
            Some(&sink),
            &cancel,
        ));
        sink.finish();
        result?
    };

    if args.json {
        println!("{}", result_json(&result));
    } else {
        print_summary(&result, partial.path());
    }

    into_exit(result)
}

/// Map command-line flags onto per-call overrides.
fn build_options(args: &GetArgs) -> Result<DownloadOptions, CliError> {
    let mut options = DownloadOptions::new();

    if let Some(retries) = args.retries {
        options = options.with_max_retries(retries);
    }
    if let Some(secs) = args.timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if args.no_resume {
        options = options.with_allow_resume(false);
    }
    for (name, value) in &args.headers {
        options = options.with_header(name, value);
    }

    options = match (&args.hash, args.algorithm) {
        (Some(hash), algorithm) => {
            options.with_expected_hash(hash, resolve_algorithm(algorithm, hash)?)
        }
        // Digest is computed and reported, not compared
        (None, Some(algorithm)) => options.with_hash_algorithm(algorithm.into()),
        (None, None) => options,
    };

    Ok(options)
}

fn into_exit(result: DownloadResult) -> Result<(), CliError> {
    match result.outcome {
        DownloadOutcome::Completed => Ok(()),
        DownloadOutcome::Cancelled => Err(CliError::Cancelled),
        DownloadOutcome::Failed => Err(CliError::Failed(
            result
                .error_message
                .unwrap_or_else(|| "unknown error".to_string()),
        )),
    }
}
