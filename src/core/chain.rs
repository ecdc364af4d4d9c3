//! Chain store
//!
//! The ordered list of committed blocks, starting at the fixed genesis, plus
//! lookup indexes by block hash, transaction hash and wallet. Appending a
//! block also commits it to the UTXO set; either both happen or neither.

use crate::core::block::{Block, MAX_BLOCK_TXS};
use crate::core::transaction::Transaction;
use crate::core::utxo::{UtxoError, UtxoSet};
use std::collections::HashMap;
use thiserror::Error;

/// Default mining difficulty (number of leading zero bits)
pub const DEFAULT_DIFFICULTY: u32 = 16;

/// Why a candidate block cannot extend the chain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainAppendFailure {
    #[error("Stale parent: expected index {expected_index} on {expected_hash}")]
    StaleParent {
        expected_index: u64,
        expected_hash: String,
    },
    #[error("Timestamp earlier than parent")]
    TimestampRegression,
    #[error("Invalid proof of work")]
    BadProofOfWork,
    #[error("Merkle root does not match transactions")]
    MerkleMismatch,
    #[error("Block has no transactions")]
    EmptyBlock,
    #[error("Block has {count} transactions, more than {max}")]
    TooManyTransactions { count: usize, max: usize },
    #[error("Transaction {0} has a bad hash or signature")]
    InvalidTransaction(String),
    #[error("UTXO conflict: {0}")]
    UtxoConflict(#[from] UtxoError),
}

/// Where a committed transaction lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxLocation {
    block: usize,
    position: usize,
}

/// A committed transaction together with the block that holds it
#[derive(Debug, Clone, Copy)]
pub struct ChainTransaction<'a> {
    pub block: &'a Block,
    pub transaction: &'a Transaction,
}

#[derive(Debug, Clone)]
pub struct ChainStore {
    blocks: Vec<Block>,
    /// Difficulty required of the next block
    difficulty: u32,
    by_hash: HashMap<String, usize>,
    by_tx: HashMap<String, TxLocation>,
    by_wallet: HashMap<String, Vec<TxLocation>>,
}

impl ChainStore {
    /// A chain holding only genesis
    pub fn new(difficulty: u32) -> Self {
        let mut store = Self {
            blocks: Vec::new(),
            difficulty,
            by_hash: HashMap::new(),
            by_tx: HashMap::new(),
            by_wallet: HashMap::new(),
        };
        store.push(Block::genesis());
        store
    }

    /// Rebuild a store and its UTXO set from persisted blocks
    ///
    /// Every block is re-checked. Blocks keep the difficulty they were mined
    /// at; `difficulty` applies to blocks appended afterwards.
    pub fn from_blocks(
        blocks: Vec<Block>,
        difficulty: u32,
    ) -> Result<(Self, UtxoSet), ChainAppendFailure> {
        let mut store = Self::new(difficulty);
        let mut utxos = UtxoSet::new();

        let mut blocks = blocks.into_iter();
        match blocks.next() {
            Some(genesis) if genesis == store.blocks[0] => {}
            Some(_) => {
                return Err(ChainAppendFailure::StaleParent {
                    expected_index: 0,
                    expected_hash: store.tip().hash.clone(),
                })
            }
            None => return Ok((store, utxos)),
        }

        for block in blocks {
            store.check_block(&block, false)?;
            utxos.commit(&block)?;
            store.push(block);
        }

        log::info!(
            "Replayed {} blocks, {} unspent outputs",
            store.blocks.len(),
            utxos.unspent_count()
        );
        Ok((store, utxos))
    }

    pub fn tip(&self) -> &Block {
        // `new` always pushes genesis and nothing ever pops
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn block_at(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.by_hash.get(hash).map(|&i| &self.blocks[i])
    }

    pub fn all_blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn find_transaction(&self, tx_hash: &str) -> Option<ChainTransaction<'_>> {
        self.by_tx.get(tx_hash).map(|loc| self.resolve(*loc))
    }

    /// Committed transactions the wallet sent, received or was levied by,
    /// in chain order
    pub fn transactions_for(&self, wallet_id: &str) -> Vec<ChainTransaction<'_>> {
        self.by_wallet
            .get(wallet_id)
            .map(|locs| locs.iter().map(|loc| self.resolve(*loc)).collect())
            .unwrap_or_default()
    }

    pub fn transaction_count(&self) -> usize {
        self.by_tx.len()
    }

    fn resolve(&self, loc: TxLocation) -> ChainTransaction<'_> {
        let block = &self.blocks[loc.block];
        ChainTransaction {
            block,
            transaction: &block.transactions[loc.position],
        }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Check that `block` may extend the current tip
    pub fn validate_append(&self, block: &Block) -> Result<(), ChainAppendFailure> {
        self.check_block(block, true)
    }

    fn check_block(&self, block: &Block, enforce_difficulty: bool) -> Result<(), ChainAppendFailure> {
        let tip = self.tip();

        if block.index != tip.index + 1 || block.header.previous_hash != tip.hash {
            return Err(ChainAppendFailure::StaleParent {
                expected_index: tip.index + 1,
                expected_hash: tip.hash.clone(),
            });
        }
        if block.header.timestamp < tip.header.timestamp {
            return Err(ChainAppendFailure::TimestampRegression);
        }
        if block.transactions.len() > MAX_BLOCK_TXS {
            return Err(ChainAppendFailure::TooManyTransactions {
                count: block.transactions.len(),
                max: MAX_BLOCK_TXS,
            });
        }
        if enforce_difficulty && block.header.difficulty != self.difficulty {
            return Err(ChainAppendFailure::BadProofOfWork);
        }
        if !block.verify_hash() || !block.is_valid_pow() {
            return Err(ChainAppendFailure::BadProofOfWork);
        }
        if !block.verify_merkle_root() {
            return Err(ChainAppendFailure::MerkleMismatch);
        }
        if block.transactions.is_empty() {
            return Err(ChainAppendFailure::EmptyBlock);
        }
        if let Some(tx) = block.transactions.iter().find(|tx| !tx.verify_signature()) {
            return Err(ChainAppendFailure::InvalidTransaction(tx.hash.clone()));
        }
        Ok(())
    }

    /// Validate, commit to `utxos`, then push the block
    ///
    /// On any failure neither the chain nor the UTXO set changes.
    pub fn append(&mut self, block: Block, utxos: &mut UtxoSet) -> Result<(), ChainAppendFailure> {
        self.validate_append(&block)?;
        utxos.commit(&block)?;
        log::info!(
            "Block #{} appended ({} txs, hash {})",
            block.index,
            block.tx_count(),
            &block.hash[..block.hash.len().min(16)]
        );
        self.push(block);
        Ok(())
    }

    fn push(&mut self, block: Block) {
        let block_pos = self.blocks.len();
        self.by_hash.insert(block.hash.clone(), block_pos);

        for (position, tx) in block.transactions.iter().enumerate() {
            let loc = TxLocation {
                block: block_pos,
                position,
            };
            self.by_tx.insert(tx.hash.clone(), loc);
            self.by_wallet
                .entry(tx.sender_wallet_id.clone())
                .or_default()
                .push(loc);
            if tx.recipient_wallet_id != tx.sender_wallet_id {
                self.by_wallet
                    .entry(tx.recipient_wallet_id.clone())
                    .or_default()
                    .push(loc);
            }
        }

        self.blocks.push(block);
    }

    /// Re-check linkage, proof-of-work and merkle roots of the whole chain
    ///
    /// Returns the index of the first bad block.
    pub fn verify(&self) -> Result<(), u64> {
        for pair in self.blocks.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            let linked = current.header.previous_hash == previous.hash
                && current.index == previous.index + 1
                && current.header.timestamp >= previous.header.timestamp;
            if !linked
                || !current.verify_hash()
                || !current.is_valid_pow()
                || !current.verify_merkle_root()
            {
                return Err(current.index);
            }
        }
        Ok(())
    }

    /// Total transactions and output value, for status endpoints
    pub fn stats(&self, utxos: &UtxoSet) -> ChainStats {
        ChainStats {
            height: self.height(),
            total_blocks: self.blocks.len() as u64,
            total_transactions: self.transaction_count() as u64,
            total_unspent: utxos.total_unspent(),
            difficulty: self.difficulty,
            latest_hash: self.tip().hash.clone(),
        }
    }
}

/// Chain statistics
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_unspent: u128,
    pub difficulty: u32,
    pub latest_hash: String,
}
