//! Content hashing and verification

use sha2::{Digest, Sha256};
use thiserror::Error;
use webcdn_peer::ResourceId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Hash mismatch: expected {expected}, got {actual}")]
pub struct IntegrityError {
    pub expected: String,
    pub actual: String,
}

/// Lowercase hex SHA-256 of `data`
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Resource id of something addressed by its fallback URL
pub fn resource_id_for_url(url: &str) -> ResourceId {
    ResourceId::new(content_hash(url.as_bytes()))
}

/// Check `content` against `expected`; returns the computed hash
pub fn verify(expected: &str, content: &[u8]) -> Result<String, IntegrityError> {
    let actual = content_hash(content);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(actual)
    } else {
        Err(IntegrityError {
            expected: expected.to_string(),
            actual,
        })
    }
}
