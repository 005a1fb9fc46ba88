//! Digest calculation and verification for downloaded files.
//!
//! Files are streamed through the digest in fixed-size reads, so verifying a
//! multi-gigabyte artifact never loads it into memory. Digests are rendered
//! as lowercase hex; comparisons ignore case and separator characters such as
//! the dash-grouped output of some platform tools.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// No verification requested.
    #[default]
    None,
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Length of the hex rendering of this digest, if any.
    pub fn hex_len(&self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Md5 => Some(32),
            Self::Sha256 => Some(64),
            Self::Sha512 => Some(128),
        }
    }

    /// Guess the algorithm from the length of a hex digest.
    ///
    /// Separators are ignored, so `"d41d8cd9-8f00b204-..."` infers MD5.
    pub fn infer(digest: &str) -> Option<Self> {
        match normalize_digest(digest).len() {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(format!("unknown hash algorithm: {}", other)),
        }
    }
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Whether the file matched the expected digest.
    pub verified: bool,
    /// Lowercase hex digest of the file contents.
    pub actual_hash: String,
}

/// Strip separators and lowercase a hex digest for comparison.
pub fn normalize_digest(digest: &str) -> String {
    digest
        .chars()
        .filter(|c| !matches!(c, '-' | ':' | '_') && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Streams files through a digest function.
#[derive(Debug, Clone)]
pub struct ChecksumVerifier {
    buffer_size: usize,
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumVerifier {
    /// Create a verifier with the default 64KB read buffer.
    pub fn new() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
        }
    }

    /// Create a verifier with a custom read buffer size (minimum 1 byte).
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Compute the lowercase hex digest of a file.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::FileNotFound`] if `path` does not exist
    /// - [`DownloadError::UnsupportedAlgorithm`] for [`HashAlgorithm::None`]
    /// - [`DownloadError::ReadFailed`] if the file cannot be read
    pub async fn compute(&self, path: &Path, algorithm: HashAlgorithm) -> Result<String, DownloadError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(DownloadError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        match algorithm {
            HashAlgorithm::None => Err(DownloadError::UnsupportedAlgorithm(algorithm)),
            HashAlgorithm::Md5 => self.hash_file::<Md5>(path).await,
            HashAlgorithm::Sha256 => self.hash_file::<Sha256>(path).await,
            HashAlgorithm::Sha512 => self.hash_file::<Sha512>(path).await,
        }
    }

    /// Verify a file against an expected digest.
    ///
    /// The comparison is case-insensitive and ignores `-`, `:`, `_` and
    /// whitespace in either digest. A mismatch is `Ok` with
    /// `verified == false`; only precondition and read failures are `Err`.
    pub async fn verify(
        &self,
        path: &Path,
        expected: &str,
        algorithm: HashAlgorithm,
    ) -> Result<Verification, DownloadError> {
        let actual_hash = self.compute(path, algorithm).await?;
        let verified = normalize_digest(expected) == actual_hash;

        tracing::debug!(
            path = %path.display(),
            algorithm = %algorithm,
            verified,
            "Checksum verification finished"
        );

        Ok(Verification {
            verified,
            actual_hash,
        })
    }

    async fn hash_file<D: Digest>(&self, path: &Path) -> Result<String, DownloadError> {
        let read_failed = |source| DownloadError::ReadFailed {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).await.map_err(read_failed)?;
        let mut hasher = D::new();
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let bytes_read = file.read(&mut buffer).await.map_err(read_failed)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}
