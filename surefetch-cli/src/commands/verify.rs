//! Verify command - check a local file against a digest.

use std::path::PathBuf;

use clap::Args;
use console::style;
use surefetch::download::normalize_digest;
use surefetch::ChecksumVerifier;

use super::common::{resolve_algorithm, runtime, AlgorithmArg};
use crate::error::CliError;

/// Arguments for the verify command.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// File to check
    pub file: PathBuf,

    /// Expected digest (hex)
    pub hash: String,

    /// Digest algorithm (inferred from the digest length when omitted)
    #[arg(long, value_enum)]
    pub algorithm: Option<AlgorithmArg>,
}

/// Run the verify command.
pub fn run(args: VerifyArgs) -> Result<(), CliError> {
    let algorithm = resolve_algorithm(args.algorithm, &args.hash)?;
    let verifier = ChecksumVerifier::new();

    let verification = runtime()?.block_on(verifier.verify(&args.file, &args.hash, algorithm))?;

    println!("{}  {}", verification.actual_hash, args.file.display());

    if verification.verified {
        println!("{} {} matches", style("OK").green().bold(), algorithm);
        Ok(())
    } else {
        println!("{} {} does not match", style("MISMATCH").red().bold(), algorithm);
        Err(CliError::Mismatch {
            expected: normalize_digest(&args.hash),
            actual: verification.actual_hash,
        })
    }
}
