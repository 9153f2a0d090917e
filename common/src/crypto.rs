use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::fmt;

use crate::types::Hash32;

/// Digest capability used by the merkle tree. Keccak-256 is required for
/// parity with the on-chain verifier; other digests are only useful in tests.
pub trait HashFunction: Send + Sync + fmt::Debug {
    fn hash(&self, data: &[u8]) -> Hash32;

    fn name(&self) -> &'static str;

    /// Hash `left ‖ right`, buffering both halves into one input
    fn hash_concat(&self, left: &[u8], right: &[u8]) -> Hash32 {
        let mut buf = Vec::with_capacity(left.len() + right.len());
        buf.extend_from_slice(left);
        buf.extend_from_slice(right);
        self.hash(&buf)
    }
}

/// Ethereum Keccak-256 (not the standardized SHA3-256)
#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak256Hasher;

impl HashFunction for Keccak256Hasher {
    fn hash(&self, data: &[u8]) -> Hash32 {
        keccak256(data)
    }

    fn name(&self) -> &'static str {
        "keccak256"
    }

    fn hash_concat(&self, left: &[u8], right: &[u8]) -> Hash32 {
        let mut hasher = Keccak256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl HashFunction for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Hash32 {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase `0x`-prefixed hex rendering
pub fn to_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty_vector() {
        assert_eq!(
            to_hex_prefixed(&keccak256(b"")),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hash_concat_matches_hash_of_concatenation() {
        let left = [1u8; 32];
        let right = [2u8; 32];
        let mut joined = left.to_vec();
        joined.extend_from_slice(&right);

        assert_eq!(Keccak256Hasher.hash_concat(&left, &right), Keccak256Hasher.hash(&joined));
        assert_eq!(Sha256Hasher.hash_concat(&left, &right), Sha256Hasher.hash(&joined));
    }

    #[test]
    fn test_hashers_differ() {
        assert_ne!(Keccak256Hasher.hash(b"airdrop"), Sha256Hasher.hash(b"airdrop"));
        assert_eq!(Keccak256Hasher.name(), "keccak256");
        assert_eq!(Sha256Hasher.name(), "sha256");
    }
}
