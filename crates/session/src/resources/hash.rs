// Content checksums for file-list manifests.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tandem_common::filelist::Checksum;

/// Lowercase hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> Checksum {
    let digest = Sha256::digest(content);
    hex_encode(&digest)
}

pub fn hash_file(path: &Path) -> Result<Checksum> {
    let content = std::fs::read(path)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
    Ok(sha256_hex(&content))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
