//! Merkle root over an ordered list of transaction hashes
//!
//! Nodes are hashed pairwise up a binary tree. An odd node at any level is
//! paired with itself.

use super::hash::sha256;

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(left);
    data.extend_from_slice(right);
    sha256(&data)
}

fn next_level(level: &[Vec<u8>]) -> Vec<Vec<u8>> {
    level
        .chunks(2)
        .map(|chunk| {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            hash_pair(&chunk[0], right)
        })
        .collect()
}

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Vec<u8> {
    if hashes.is_empty() {
        return sha256(b"");
    }

    let mut current_level: Vec<Vec<u8>> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = next_level(&current_level);
    }

    current_level.remove(0)
}

/// Merkle root from hex-encoded hashes
///
/// Entries that are not valid hex are hashed as raw text so that a tampered
/// hash still changes the root.
pub fn calculate_merkle_root_hex(hex_hashes: &[String]) -> String {
    let hashes: Vec<Vec<u8>> = hex_hashes
        .iter()
        .map(|h| hex::decode(h).unwrap_or_else(|_| sha256(h.as_bytes())))
        .collect();
    hex::encode(calculate_merkle_root(&hashes))
}

/// Sibling path proving that one transaction is included under a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Sibling hashes from leaf to root; `true` when the sibling is on the left
    pub siblings: Vec<(Vec<u8>, bool)>,
}

impl MerkleProof {
    /// Build the proof for the leaf at `index`
    pub fn build(hashes: &[Vec<u8>], index: usize) -> Option<Self> {
        if index >= hashes.len() {
            return None;
        }

        let mut siblings = Vec::new();
        let mut level: Vec<Vec<u8>> = hashes.to_vec();
        let mut position = index;

        while level.len() > 1 {
            let sibling_index = if position % 2 == 0 {
                (position + 1).min(level.len() - 1)
            } else {
                position - 1
            };
            siblings.push((level[sibling_index].clone(), position % 2 == 1));

            level = next_level(&level);
            position /= 2;
        }

        Some(Self { siblings })
    }

    /// Verify the proof against a root hash
    pub fn verify(&self, leaf_hash: &[u8], root_hash: &[u8]) -> bool {
        let mut current = leaf_hash.to_vec();

        for (sibling, is_left) in &self.siblings {
            current = if *is_left {
                hash_pair(sibling, &current)
            } else {
                hash_pair(&current, sibling)
            };
        }

        current == root_hash
    }
}
