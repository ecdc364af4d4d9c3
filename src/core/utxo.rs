//! The UTXO set
//!
//! A materialised view over the chain: every output ever created, keyed by
//! UTXO id, with a secondary per-wallet index and a running balance per
//! wallet. It is rebuilt by replaying committed blocks and never diverges
//! from them.
//!
//! Spent outputs stay in the map with status `spent` so lookups can report
//! them. A UTXO moves from `unspent` to `spent` exactly once, when the block
//! consuming it commits.

use crate::core::amount::Amount;
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("Unknown UTXO: {0}")]
    UnknownUtxo(String),
    #[error("UTXO already spent: {0}")]
    AlreadySpent(String),
    #[error("UTXO spent twice in one block: {0}")]
    DuplicateInput(String),
    #[error("UTXO already exists: {0}")]
    DuplicateOutput(String),
    #[error("UTXO is not spent and cannot be restored: {0}")]
    NotSpent(String),
    #[error("Output {0} was spent later and cannot be removed")]
    OutputSpent(String),
    #[error("Balance overflow for wallet {0}")]
    BalanceOverflow(String),
}

// =============================================================================
// UTXO
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtxoStatus {
    Unspent,
    Spent,
}

/// A discrete chunk of value owned by one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    /// `{tx_hash}:{output_index}`
    pub id: String,
    pub wallet_id: String,
    pub amount: Amount,
    /// Block that created this output; empty while only pending
    pub block_hash: String,
    pub status: UtxoStatus,
}

impl Utxo {
    pub fn unspent(id: String, wallet_id: &str, amount: Amount, block_hash: &str) -> Self {
        Self {
            id,
            wallet_id: wallet_id.to_string(),
            amount,
            block_hash: block_hash.to_string(),
            status: UtxoStatus::Unspent,
        }
    }

    pub fn is_unspent(&self) -> bool {
        self.status == UtxoStatus::Unspent
    }
}

// =============================================================================
// UTXO Set
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    /// Every known output by id
    entries: HashMap<String, Utxo>,
    /// Ids owned by each wallet, in creation order
    by_wallet: HashMap<String, Vec<String>>,
    /// Running total of unspent amounts per wallet
    balances: HashMap<String, Amount>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a set by committing blocks in order
    pub fn replay<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Result<Self, UtxoError> {
        let mut set = Self::new();
        for block in blocks {
            set.commit(block)?;
        }
        Ok(set)
    }

    pub fn lookup(&self, utxo_id: &str) -> Option<&Utxo> {
        self.entries.get(utxo_id)
    }

    /// Sum of unspent outputs owned by the wallet
    pub fn balance_of(&self, wallet_id: &str) -> Amount {
        self.balances.get(wallet_id).copied().unwrap_or(0)
    }

    /// Unspent outputs owned by the wallet, oldest first
    pub fn unspent_of(&self, wallet_id: &str) -> Vec<&Utxo> {
        self.owned_by(wallet_id)
            .filter(|utxo| utxo.is_unspent())
            .collect()
    }

    /// Every output the wallet has ever owned, oldest first
    pub fn owned_by<'a>(&'a self, wallet_id: &str) -> impl Iterator<Item = &'a Utxo> + 'a {
        self.by_wallet
            .get(wallet_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.entries.get(id))
    }

    /// Number of outputs ever created
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unspent_count(&self) -> usize {
        self.entries.values().filter(|u| u.is_unspent()).count()
    }

    /// Total unspent value across all wallets
    pub fn total_unspent(&self) -> u128 {
        self.balances.values().map(|b| *b as u128).sum()
    }

    /// Read-isolated view for validating candidates without mutating the set
    pub fn begin_trial(&self) -> TrialView<'_> {
        TrialView {
            base: self,
            reserved: HashSet::new(),
            created: HashMap::new(),
        }
    }

    // =========================================================================
    // Commit / Rollback
    // =========================================================================

    /// Check that `block` can be committed without applying anything
    pub fn check_commit(&self, block: &Block) -> Result<(), UtxoError> {
        let mut spent_in_block: HashSet<&str> = HashSet::new();
        let mut created_in_block: HashSet<String> = HashSet::new();
        let mut credits: HashMap<&str, Amount> = HashMap::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                if !spent_in_block.insert(input.as_str()) {
                    return Err(UtxoError::DuplicateInput(input.clone()));
                }
                match self.entries.get(input) {
                    Some(utxo) if utxo.is_unspent() => {}
                    Some(_) => return Err(UtxoError::AlreadySpent(input.clone())),
                    None if created_in_block.contains(input) => {}
                    None => return Err(UtxoError::UnknownUtxo(input.clone())),
                }
            }

            for (id, output) in tx.output_ids().into_iter().zip(&tx.outputs) {
                if self.entries.contains_key(&id) || created_in_block.contains(&id) {
                    return Err(UtxoError::DuplicateOutput(id));
                }
                created_in_block.insert(id);

                let overflow = || UtxoError::BalanceOverflow(output.wallet_id.clone());
                let credit = credits.entry(output.wallet_id.as_str()).or_insert(0);
                *credit = credit.checked_add(output.amount).ok_or_else(overflow)?;
                self.balance_of(&output.wallet_id)
                    .checked_add(*credit)
                    .ok_or_else(overflow)?;
            }
        }

        Ok(())
    }

    /// Spend every input and create every output of `block`, or change nothing
    ///
    /// This is the double-spend guard: an unknown or already spent input
    /// fails the whole block.
    pub fn commit(&mut self, block: &Block) -> Result<(), UtxoError> {
        self.check_commit(block)?;

        for tx in &block.transactions {
            self.apply_transaction(tx, &block.hash)?;
        }
        Ok(())
    }

    fn apply_transaction(&mut self, tx: &Transaction, block_hash: &str) -> Result<(), UtxoError> {
        for input in &tx.inputs {
            self.mark_spent(input)?;
        }
        for utxo in tx.created_utxos(block_hash) {
            self.insert(utxo)?;
        }
        Ok(())
    }

    /// Undo a committed block: remove its outputs and restore its inputs
    ///
    /// Only valid for the most recently committed block. All-or-nothing.
    pub fn rollback(&mut self, block: &Block) -> Result<(), UtxoError> {
        let mut next = self.clone();
        for tx in block.transactions.iter().rev() {
            for id in tx.output_ids() {
                next.remove_unspent(&id)?;
            }
            for input in &tx.inputs {
                next.restore(input)?;
            }
        }
        *self = next;
        Ok(())
    }

    fn mark_spent(&mut self, utxo_id: &str) -> Result<(), UtxoError> {
        let utxo = self
            .entries
            .get_mut(utxo_id)
            .ok_or_else(|| UtxoError::UnknownUtxo(utxo_id.to_string()))?;
        if !utxo.is_unspent() {
            return Err(UtxoError::AlreadySpent(utxo_id.to_string()));
        }
        utxo.status = UtxoStatus::Spent;

        let (wallet_id, amount) = (utxo.wallet_id.clone(), utxo.amount);
        self.debit(&wallet_id, amount);
        Ok(())
    }

    fn restore(&mut self, utxo_id: &str) -> Result<(), UtxoError> {
        let utxo = self
            .entries
            .get_mut(utxo_id)
            .ok_or_else(|| UtxoError::UnknownUtxo(utxo_id.to_string()))?;
        if utxo.is_unspent() {
            return Err(UtxoError::NotSpent(utxo_id.to_string()));
        }
        utxo.status = UtxoStatus::Unspent;

        let (wallet_id, amount) = (utxo.wallet_id.clone(), utxo.amount);
        self.credit(&wallet_id, amount)
    }

    fn insert(&mut self, utxo: Utxo) -> Result<(), UtxoError> {
        if self.entries.contains_key(&utxo.id) {
            return Err(UtxoError::DuplicateOutput(utxo.id));
        }
        self.credit(&utxo.wallet_id, utxo.amount)?;
        self.by_wallet
            .entry(utxo.wallet_id.clone())
            .or_default()
            .push(utxo.id.clone());
        self.entries.insert(utxo.id.clone(), utxo);
        Ok(())
    }

    fn remove_unspent(&mut self, utxo_id: &str) -> Result<(), UtxoError> {
        match self.entries.get(utxo_id) {
            None => return Err(UtxoError::UnknownUtxo(utxo_id.to_string())),
            Some(utxo) if !utxo.is_unspent() => {
                return Err(UtxoError::OutputSpent(utxo_id.to_string()))
            }
            Some(_) => {}
        }

        if let Some(utxo) = self.entries.remove(utxo_id) {
            self.debit(&utxo.wallet_id, utxo.amount);
            if let Some(ids) = self.by_wallet.get_mut(&utxo.wallet_id) {
                ids.retain(|id| id != utxo_id);
                if ids.is_empty() {
                    self.by_wallet.remove(&utxo.wallet_id);
                }
            }
        }
        Ok(())
    }

    fn credit(&mut self, wallet_id: &str, amount: Amount) -> Result<(), UtxoError> {
        if amount == 0 {
            return Ok(());
        }
        let balance = self.balances.entry(wallet_id.to_string()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| UtxoError::BalanceOverflow(wallet_id.to_string()))?;
        Ok(())
    }

    fn debit(&mut self, wallet_id: &str, amount: Amount) {
        if let Some(balance) = self.balances.get_mut(wallet_id) {
            *balance = balance.saturating_sub(amount);
            if *balance == 0 {
                self.balances.remove(wallet_id);
            }
        }
    }
}

// =============================================================================
// Trial View
// =============================================================================

/// Read-isolated view of the set plus the effects of a pending batch
///
/// Transactions accepted into the batch are applied to the overlay only:
/// their inputs become reserved and their outputs become visible. The
/// underlying set is never touched.
#[derive(Debug, Clone)]
pub struct TrialView<'a> {
    base: &'a UtxoSet,
    /// Inputs consumed by transactions already in the batch
    reserved: HashSet<String>,
    /// Outputs created by transactions already in the batch
    created: HashMap<String, Utxo>,
}

impl<'a> TrialView<'a> {
    /// Committed or batch-created output with its committed status
    pub fn get(&self, utxo_id: &str) -> Option<&Utxo> {
        self.base
            .lookup(utxo_id)
            .or_else(|| self.created.get(utxo_id))
    }

    /// Whether an earlier transaction in the batch already consumes this id
    pub fn is_reserved(&self, utxo_id: &str) -> bool {
        self.reserved.contains(utxo_id)
    }

    pub fn is_spendable(&self, utxo_id: &str) -> bool {
        self.get(utxo_id).map(Utxo::is_unspent).unwrap_or(false) && !self.is_reserved(utxo_id)
    }

    /// Committed unspent outputs of the wallet that the batch has not reserved
    pub fn spendable_of(&self, wallet_id: &str) -> Vec<&'a Utxo> {
        self.base
            .unspent_of(wallet_id)
            .into_iter()
            .filter(|utxo| !self.reserved.contains(&utxo.id))
            .collect()
    }

    /// Committed balance minus what the batch has reserved
    pub fn available_balance(&self, wallet_id: &str) -> Amount {
        self.spendable_of(wallet_id).iter().map(|u| u.amount).sum()
    }

    /// Seed the view with an accepted transaction
    pub fn apply(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.reserved.insert(input.clone());
        }
        for utxo in tx.created_utxos("") {
            self.created.insert(utxo.id.clone(), utxo);
        }
    }
}
