//! Custodial wallets
//!
//! Each wallet is a secp256k1 key pair held by the ledger. The ledger signs
//! transfers and levies on the owner's behalf.

use crate::core::{Amount, Transaction, TransactionBuilder, TransactionError, Utxo};
use crate::crypto::KeyPair;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: Amount, need: Amount },
    #[error("Unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] crate::crypto::KeyError),
    #[error("Wallet file {path} holds key for {actual}")]
    Mismatch { path: String, actual: String },
}

/// Serializable wallet data for persistence
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletData {
    private_key_hex: String,
    wallet_id: String,
    label: Option<String>,
    created_at: DateTime<Utc>,
}

pub struct Wallet {
    key_pair: KeyPair,
    /// Owner reference supplied at registration
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(label: Option<&str>) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            label: label.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Import a wallet from a private key
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, WalletError> {
        let key_pair = KeyPair::from_private_key_hex(private_key_hex)?;
        Ok(Self {
            key_pair,
            label: None,
            created_at: Utc::now(),
        })
    }

    pub fn wallet_id(&self) -> String {
        self.key_pair.wallet_id()
    }

    pub fn public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Transfer spending `spendable` greedily, oldest first, until
    /// `amount + fee` is covered
    ///
    /// When the outputs cannot cover it every one is used and the validator
    /// reports the shortfall.
    pub fn build_transfer(
        &self,
        recipient: &str,
        amount: Amount,
        fee: Amount,
        note: &str,
        spendable: &[&Utxo],
    ) -> Result<Transaction, WalletError> {
        let target = amount.saturating_add(fee);
        let builder = select_inputs(spendable, target)
            .into_iter()
            .fold(
                TransactionBuilder::transfer(&self.wallet_id(), recipient, amount),
                |builder, utxo| builder.add_input(utxo),
            )
            .fee(fee)
            .note(note);
        Ok(builder.build_and_sign(&self.key_pair)?)
    }

    /// Levy deduction from `spendable`, oldest outputs first
    pub fn build_levy(
        &self,
        amount: Amount,
        note: &str,
        spendable: &[&Utxo],
        timestamp: DateTime<Utc>,
    ) -> Result<Transaction, WalletError> {
        let have: Amount = spendable.iter().map(|u| u.amount).sum();
        if have < amount {
            return Err(WalletError::InsufficientFunds { have, need: amount });
        }

        let builder = select_inputs(spendable, amount)
            .into_iter()
            .fold(TransactionBuilder::levy(&self.wallet_id(), amount), |b, utxo| {
                b.add_input(utxo)
            })
            .note(note)
            .timestamp(timestamp);
        Ok(builder.build_and_sign(&self.key_pair)?)
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let data = WalletData {
            private_key_hex: self.key_pair.private_key_hex(),
            wallet_id: self.wallet_id(),
            label: self.label.clone(),
            created_at: self.created_at,
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;

        let mut wallet = Self::from_private_key(&data.private_key_hex)?;
        if wallet.wallet_id() != data.wallet_id {
            return Err(WalletError::Mismatch {
                path: path.display().to_string(),
                actual: wallet.wallet_id(),
            });
        }
        wallet.label = data.label;
        wallet.created_at = data.created_at;
        Ok(wallet)
    }

    /// Export wallet info (without private key)
    pub fn export_public_info(&self) -> WalletInfo {
        WalletInfo {
            wallet_id: self.wallet_id(),
            public_key: self.public_key(),
            label: self.label.clone(),
            created_at: self.created_at,
        }
    }
}

/// Oldest-first prefix of `spendable` whose sum reaches `target`, or all of it
fn select_inputs<'a>(spendable: &[&'a Utxo], target: Amount) -> Vec<&'a Utxo> {
    let mut selected = Vec::new();
    let mut total: Amount = 0;
    for utxo in spendable {
        if total >= target && !selected.is_empty() {
            break;
        }
        selected.push(*utxo);
        total = total.saturating_add(utxo.amount);
    }
    selected
}

/// Public wallet information (safe to share)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfo {
    pub wallet_id: String,
    pub public_key: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}
