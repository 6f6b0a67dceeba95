//! SHA-256 utilities
//!
//! - Key ids (truncated digests of identity publics)
//! - Media ids
//! - Constant-time digest comparison

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Digest several segments as one message without concatenating buffers.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Constant-time comparison to prevent timing side channels.
pub fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_match_concatenation() {
        let joined = sha256(b"hello world");
        let parted = sha256_parts(&[b"hello", b" ", b"world"]);
        assert_eq!(joined, parted);
    }

    #[test]
    fn constant_time_eq_detects_last_byte() {
        let a = [7u8; 32];
        let mut b = a;
        assert!(constant_time_eq(&a, &b));
        b[31] ^= 1;
        assert!(!constant_time_eq(&a, &b));
    }
}
