//! SHA-256 content digests.
//!
//! Every file hash the engine persists (ledger entries, drift detection,
//! resolution-cache verification) is the lowercase hex SHA-256 of the
//! file's bytes.

use std::fs;
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hex digest of a file's contents.
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
    Ok(sha256_bytes(&content))
}

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
