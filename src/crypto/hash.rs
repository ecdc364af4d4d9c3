//! Hashing primitives for the ledger
//!
//! SHA-256 is used for transaction hashes and merkle nodes, double SHA-256
//! for block hashes. Proof-of-work is expressed as a count of leading zero
//! bits in the block hash.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 of SHA-256, used for block hashes
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// Checks whether a hash has at least `difficulty` leading zero bits
pub fn meets_difficulty(hash: &[u8], difficulty: u32) -> bool {
    let required_zeros = difficulty as usize / 8;
    let remaining_bits = difficulty as usize % 8;

    if hash.len() < required_zeros + usize::from(remaining_bits > 0) {
        return false;
    }

    if hash.iter().take(required_zeros).any(|byte| *byte != 0) {
        return false;
    }

    if remaining_bits > 0 {
        let mask = 0xFFu8 << (8 - remaining_bits);
        if hash[required_zeros] & mask != 0 {
            return false;
        }
    }

    true
}
