//! Common types and utilities shared across CLI commands.

use std::path::Path;

use clap::ValueEnum;
use surefetch::{DownloadConfiguration, HashAlgorithm};

use crate::error::CliError;

/// Digest algorithm selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum AlgorithmArg {
    /// MD5 (32 hex digits)
    Md5,
    /// SHA-256 (64 hex digits)
    Sha256,
    /// SHA-512 (128 hex digits)
    Sha512,
}

impl From<AlgorithmArg> for HashAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Md5 => HashAlgorithm::Md5,
            AlgorithmArg::Sha256 => HashAlgorithm::Sha256,
            AlgorithmArg::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

/// Pick the algorithm for a digest: the explicit choice, else inferred from its length.
pub fn resolve_algorithm(cli: Option<AlgorithmArg>, digest: &str) -> Result<HashAlgorithm, CliError> {
    match cli {
        Some(arg) => Ok(arg.into()),
        None => HashAlgorithm::infer(digest).ok_or_else(|| {
            CliError::Config(format!(
                "Cannot infer the algorithm of a {}-character digest. Use --algorithm.",
                digest.trim().len()
            ))
        }),
    }
}

/// Parse a `Name: value` header argument.
pub fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{}'", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Load configuration: explicit file first, then the default location, then defaults.
pub fn load_config(path: Option<&Path>) -> Result<DownloadConfiguration, CliError> {
    match path {
        Some(path) => DownloadConfiguration::load(path).map_err(CliError::from),
        None => DownloadConfiguration::load_default().map_err(CliError::from),
    }
}

/// Start a multi-threaded tokio runtime for one command.
pub fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Runtime(e.to_string()))
}
