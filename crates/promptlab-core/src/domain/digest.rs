//! SHA-256 content digests used for documents, reports and replay checks.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First 12 hex characters of a digest, for log lines.
pub fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}
