//! Cryptographic primitives for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and proof-of-work difficulty checks
//! - ECDSA key management (secp256k1) and wallet id derivation
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, meets_difficulty, sha256};
pub use keys::{
    is_valid_wallet_id, public_key_from_hex, public_key_to_wallet_id, sign_message,
    verify_signature, KeyError, KeyPair,
};
pub use merkle::{calculate_merkle_root, calculate_merkle_root_hex, MerkleProof};
