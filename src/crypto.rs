//! Hash helpers used for frame checksums and content addressing

use crate::types::Hash;
use sha3::{Digest, Sha3_256};

/// Size of a persistable payload's content hash
pub const PAYLOAD_HASH_SIZE: usize = 20;

/// Size of the frame checksum
pub const CHECKSUM_SIZE: usize = 4;

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Truncated SHA3-256, the content address of persistable payloads
pub fn payload_hash(data: &[u8]) -> [u8; PAYLOAD_HASH_SIZE] {
    let full = sha3(data);
    let mut out = [0u8; PAYLOAD_HASH_SIZE];
    out.copy_from_slice(&full[..PAYLOAD_HASH_SIZE]);
    out
}

/// First four bytes of SHA3-256
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let full = sha3(data);
    [full[0], full[1], full[2], full[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_deterministic() {
        assert_eq!(sha3(b"offer"), sha3(b"offer"));
        assert_ne!(sha3(b"offer"), sha3(b"offer2"));
    }

    #[test]
    fn test_sha3_concat_matches_joined() {
        assert_eq!(sha3_concat(b"ab", b"cd"), sha3(b"abcd"));
    }

    #[test]
    fn test_payload_hash_is_prefix() {
        let full = sha3(b"trade statistics");
        let short = payload_hash(b"trade statistics");
        assert_eq!(&full[..PAYLOAD_HASH_SIZE], &short[..]);
    }

    #[test]
    fn test_checksum_is_prefix() {
        let full = sha3(b"frame");
        assert_eq!(checksum(b"frame"), [full[0], full[1], full[2], full[3]]);
    }
}
