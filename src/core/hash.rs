//! Identifier hashing
//!
//! Transaction ids and derived operation ids are hex SHA-256 digests.

use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Transaction id of a raw payload
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(Sha256::digest(data)))
}

/// Stable id for `parts` under a domain tag, so ids of different kinds never
/// collide even when their parts match
pub fn tagged_id(tag: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for part in parts {
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_ne!(double_sha256_hex(b"hello world"), sha256_hex(b"hello world"));
    }

    #[test]
    fn test_tagged_id() {
        assert_eq!(tagged_id("cash-in", &["tx", "A"]), sha256_hex(b"cash-in:tx:A"));
        assert_ne!(tagged_id("cash-in", &["tx", "A"]), tagged_id("fund", &["tx", "A"]));
    }
}
