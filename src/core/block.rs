//! Blocks
//!
//! A block carries an ordered list of transactions and a header that links
//! it to its parent. The block hash is a double SHA-256 over the index and
//! the header fields, and must have `difficulty` leading zero bits.

use crate::core::transaction::Transaction;
use crate::crypto::{calculate_merkle_root_hex, double_sha256, meets_difficulty, MerkleProof};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Block Constants
// =============================================================================

/// Previous-hash sentinel of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Genesis timestamp (2024-01-01T00:00:00Z)
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200;

/// Upper bound on transactions in one block
pub const MAX_BLOCK_TXS: usize = 10_000;

/// A block hash has 256 bits, so no harder target can be met
pub const MAX_DIFFICULTY: u32 = 256;

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Hash of the previous block
    pub previous_hash: String,
    /// Merkle root of the transaction hashes
    pub merkle_root: String,
    /// Never earlier than the parent's timestamp
    pub timestamp: DateTime<Utc>,
    /// Required leading zero bits
    pub difficulty: u32,
    /// Proof-of-work solution
    pub nonce: u64,
}

// =============================================================================
// Block
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    #[serde(flatten)]
    pub header: BlockHeader,
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create an unmined block stamped with the current time
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        Self::assemble(index, previous_hash, Utc::now(), difficulty, transactions)
    }

    /// Create an unmined block (nonce 0) with an explicit timestamp
    pub fn assemble(
        index: u64,
        previous_hash: String,
        timestamp: DateTime<Utc>,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let header = BlockHeader {
            previous_hash,
            merkle_root: Self::calculate_merkle_root(&transactions),
            timestamp,
            difficulty,
            nonce: 0,
        };

        let mut block = Self {
            index,
            header,
            hash: String::new(),
            transactions,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// The fixed root of every chain
    ///
    /// Genesis carries no transactions and no proof-of-work, so its hash is
    /// the same on every start.
    pub fn genesis() -> Self {
        let timestamp = DateTime::<Utc>::from_timestamp(GENESIS_TIMESTAMP, 0).unwrap_or_default();
        Self::assemble(0, GENESIS_PREVIOUS_HASH.to_string(), timestamp, 0, Vec::new())
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.header.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Merkle root over the transaction hashes, in order
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> String {
        let tx_hashes: Vec<String> = transactions.iter().map(|tx| tx.hash.clone()).collect();
        calculate_merkle_root_hex(&tx_hashes)
    }

    /// Everything the hash covers except the nonce
    ///
    /// The miner hashes `pow_prefix() || nonce` so the prefix is encoded once
    /// per search rather than once per attempt.
    pub fn pow_prefix(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(160);
        data.extend_from_slice(&self.index.to_be_bytes());
        data.extend_from_slice(self.header.previous_hash.as_bytes());
        data.push(b'|');
        data.extend_from_slice(&self.header.timestamp.timestamp_millis().to_be_bytes());
        data.extend_from_slice(self.header.merkle_root.as_bytes());
        data.push(b'|');
        data.extend_from_slice(&self.header.difficulty.to_be_bytes());
        data
    }

    /// Hash for a given prefix and nonce
    pub fn hash_with_nonce(prefix: &[u8], nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(prefix.len() + 8);
        data.extend_from_slice(prefix);
        data.extend_from_slice(&nonce.to_be_bytes());
        double_sha256(&data)
    }

    pub fn calculate_hash(&self) -> String {
        hex::encode(Self::hash_with_nonce(&self.pow_prefix(), self.header.nonce))
    }

    /// Single-threaded nonce search; returns the number of attempts
    pub fn mine(&mut self) -> u64 {
        let prefix = self.pow_prefix();
        let mut attempts = 0u64;

        for nonce in 0..=u64::MAX {
            attempts += 1;
            let hash = Self::hash_with_nonce(&prefix, nonce);
            if meets_difficulty(&hash, self.header.difficulty) {
                self.header.nonce = nonce;
                self.hash = hex::encode(hash);
                break;
            }
        }

        attempts
    }

    /// Whether the stored hash satisfies the difficulty
    pub fn is_valid_pow(&self) -> bool {
        hex::decode(&self.hash)
            .map(|hash| meets_difficulty(&hash, self.header.difficulty))
            .unwrap_or(false)
    }

    pub fn verify_merkle_root(&self) -> bool {
        Self::calculate_merkle_root(&self.transactions) == self.header.merkle_root
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Inclusion proof for one of this block's transactions
    pub fn merkle_proof(&self, tx_hash: &str) -> Option<MerkleProof> {
        let position = self.transactions.iter().position(|tx| tx.hash == tx_hash)?;
        let leaves: Vec<Vec<u8>> = self
            .transactions
            .iter()
            .map(|tx| hex::decode(&tx.hash).unwrap_or_default())
            .collect();
        MerkleProof::build(&leaves, position)
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.header.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TransactionBuilder;
    use crate::crypto::KeyPair;

    fn sample_transactions(count: usize) -> Vec<Transaction> {
        let treasury = KeyPair::generate();
        (0..count)
            .map(|i| {
                TransactionBuilder::issuance(&treasury.wallet_id(), "alice", 10 + i as u64)
                    .build_and_sign(&treasury)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_genesis_is_fixed() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.index, 0);
        assert!(a.is_genesis());
        assert!(a.transactions.is_empty());
        assert_eq!(a.header.previous_hash, "0".repeat(64));
        assert_eq!(a.timestamp().timestamp(), GENESIS_TIMESTAMP);
        assert!(a.verify_hash());
    }

    #[test]
    fn test_mining_difficulty_four() {
        let mut block = Block::new(1, Block::genesis().hash, sample_transactions(2), 4);
        let attempts = block.mine();

        assert!(attempts >= 1);
        assert!(block.is_valid_pow());
        assert!(block.verify_hash());
        assert!(block.verify_merkle_root());

        let bytes = hex::decode(&block.hash).unwrap();
        assert_eq!(bytes[0] & 0xF0, 0);
    }

    #[test]
    fn test_merkle_root_verification() {
        let mut block = Block::new(1, "0".repeat(64), sample_transactions(3), 4);
        block.mine();
        assert!(block.verify_merkle_root());

        block.transactions.swap(0, 2);
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_block_hash_verification() {
        let mut block = Block::new(1, "0".repeat(64), sample_transactions(1), 4);
        block.mine();
        assert!(block.verify_hash());

        block.header.nonce += 1;
        assert!(!block.verify_hash());
    }

    #[test]
    fn test_hash_covers_index() {
        let txs = sample_transactions(1);
        let now = Utc::now();
        let a = Block::assemble(1, "0".repeat(64), now, 0, txs.clone());
        let b = Block::assemble(2, "0".repeat(64), now, 0, txs);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_merkle_proof() {
        let block = Block::new(1, "0".repeat(64), sample_transactions(3), 0);
        let tx = &block.transactions[1];
        let proof = block.merkle_proof(&tx.hash).unwrap();

        let leaf = hex::decode(&tx.hash).unwrap();
        let root = hex::decode(&block.header.merkle_root).unwrap();
        assert!(proof.verify(&leaf, &root));
        assert!(block.merkle_proof("missing").is_none());
    }

    #[test]
    fn test_json_is_flat() {
        let block = Block::genesis();
        let json = serde_json::to_value(&block).unwrap();
        assert!(json.get("previousHash").is_some());
        assert!(json.get("merkleRoot").is_some());
        assert!(json.get("header").is_none());

        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }
}
