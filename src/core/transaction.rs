//! Ledger transactions
//!
//! A transaction consumes UTXOs owned by its sender and creates new ones.
//! Three kinds exist:
//! - `transfer`: value moves to a recipient, change returns to the sender
//! - `levy`: the periodic zakat deduction, burned against [`LEVY_SINK`]
//! - `issuance`: new value minted by the treasury authority
//!
//! The hash and the signature both cover a canonical, length-prefixed byte
//! encoding of every field except the signature and the hash themselves.

use crate::core::amount::Amount;
use crate::core::utxo::Utxo;
use crate::crypto::{
    public_key_from_hex, public_key_to_wallet_id, sha256, verify_signature, KeyError, KeyPair,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Current transaction encoding version
pub const TX_VERSION: u32 = 1;

/// Counterparty recorded on levy transactions; never owns a UTXO
pub const LEVY_SINK: &str = "ZAKAT_POOL";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while building or signing a transaction
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
    #[error("Signing key does not belong to wallet {0}")]
    WrongSigner(String),
    #[error("Input total overflows")]
    InputOverflow,
}

// =============================================================================
// Transaction Parts
// =============================================================================

/// What a transaction does to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Transfer,
    Levy,
    Issuance,
}

impl TxKind {
    fn tag(self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Levy => 1,
            TxKind::Issuance => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::Levy => "levy",
            TxKind::Issuance => "issuance",
        }
    }
}

/// A newly created output; its UTXO id is derived from the transaction hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutput {
    pub wallet_id: String,
    pub amount: Amount,
}

/// UTXO id for output `index` of transaction `tx_hash`
pub fn utxo_id(tx_hash: &str, index: usize) -> String {
    format!("{}:{}", tx_hash, index)
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub sender_wallet_id: String,
    pub recipient_wallet_id: String,
    /// Value moved (transfer, issuance) or levied (levy)
    pub amount: Amount,
    #[serde(default)]
    pub fee: Amount,
    #[serde(default)]
    pub note: String,
    /// Consumed UTXO ids
    pub inputs: Vec<String>,
    pub outputs: Vec<TransactionOutput>,
    pub timestamp: DateTime<Utc>,
    /// Random salt so identical transfers hash differently
    pub nonce: u64,
    /// Hex compressed public key of the signer
    pub public_key: String,
    /// Hex compact ECDSA signature over the hash
    pub signature: String,
    pub hash: String,
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

impl Transaction {
    /// Canonical byte encoding covered by the hash and the signature
    pub fn signing_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.kind.tag());
        put_bytes(&mut buf, self.sender_wallet_id.as_bytes());
        put_bytes(&mut buf, self.recipient_wallet_id.as_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        buf.extend_from_slice(&self.fee.to_be_bytes());
        put_bytes(&mut buf, self.note.as_bytes());

        buf.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            put_bytes(&mut buf, input.as_bytes());
        }

        buf.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            put_bytes(&mut buf, output.wallet_id.as_bytes());
            buf.extend_from_slice(&output.amount.to_be_bytes());
        }

        buf.extend_from_slice(&self.timestamp.timestamp_millis().to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        put_bytes(&mut buf, self.public_key.as_bytes());
        buf
    }

    /// Content hash of the canonical encoding
    pub fn calculate_hash(&self) -> String {
        hex::encode(sha256(&self.signing_data()))
    }

    /// Sign with the sender's key; sets the public key, hash and signature
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        if key_pair.wallet_id() != self.sender_wallet_id {
            return Err(TransactionError::WrongSigner(self.sender_wallet_id.clone()));
        }
        self.public_key = key_pair.public_key_hex();
        self.hash = self.calculate_hash();

        let digest = hex::decode(&self.hash).map_err(|_| KeyError::InvalidSignature)?;
        self.signature = hex::encode(key_pair.sign(&digest)?);
        Ok(())
    }

    /// Check the hash, the signer's wallet id and the signature
    pub fn verify_signature(&self) -> bool {
        if self.hash != self.calculate_hash() {
            return false;
        }

        let public_key = match public_key_from_hex(&self.public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        if public_key_to_wallet_id(&public_key) != self.sender_wallet_id {
            return false;
        }

        let (digest, signature) = match (hex::decode(&self.hash), hex::decode(&self.signature)) {
            (Ok(digest), Ok(signature)) => (digest, signature),
            _ => return false,
        };
        verify_signature(&public_key, &digest, &signature).unwrap_or(false)
    }

    /// UTXO ids this transaction creates, in output order
    pub fn output_ids(&self) -> Vec<String> {
        (0..self.outputs.len())
            .map(|index| utxo_id(&self.hash, index))
            .collect()
    }

    /// Materialise the outputs as unspent UTXOs created in `block_hash`
    pub fn created_utxos(&self, block_hash: &str) -> Vec<Utxo> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                Utxo::unspent(
                    utxo_id(&self.hash, index),
                    &output.wallet_id,
                    output.amount,
                    block_hash,
                )
            })
            .collect()
    }

    /// Whether the wallet sends, receives or is levied by this transaction
    pub fn involves(&self, wallet_id: &str) -> bool {
        self.sender_wallet_id == wallet_id || self.recipient_wallet_id == wallet_id
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builds a transaction from selected inputs and derives its outputs
///
/// Transfers pay the recipient first and route change back to the sender.
/// Levies create only the change output. Issuances have no inputs.
pub struct TransactionBuilder {
    kind: TxKind,
    sender: String,
    recipient: String,
    amount: Amount,
    fee: Amount,
    note: String,
    inputs: Vec<String>,
    input_total: Option<Amount>,
    timestamp: DateTime<Utc>,
}

impl TransactionBuilder {
    pub fn transfer(sender: &str, recipient: &str, amount: Amount) -> Self {
        Self::new(TxKind::Transfer, sender, recipient, amount)
    }

    pub fn levy(wallet_id: &str, amount: Amount) -> Self {
        Self::new(TxKind::Levy, wallet_id, LEVY_SINK, amount)
    }

    pub fn issuance(issuer: &str, recipient: &str, amount: Amount) -> Self {
        Self::new(TxKind::Issuance, issuer, recipient, amount)
    }

    fn new(kind: TxKind, sender: &str, recipient: &str, amount: Amount) -> Self {
        Self {
            kind,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee: 0,
            note: String::new(),
            inputs: Vec::new(),
            input_total: Some(0),
            timestamp: Utc::now(),
        }
    }

    pub fn fee(mut self, fee: Amount) -> Self {
        self.fee = fee;
        self
    }

    pub fn note(mut self, note: &str) -> Self {
        self.note = note.to_string();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Spend a UTXO
    pub fn add_input(mut self, utxo: &Utxo) -> Self {
        self.inputs.push(utxo.id.clone());
        self.input_total = self.input_total.and_then(|t| t.checked_add(utxo.amount));
        self
    }

    /// Assemble the unsigned transaction
    pub fn build(self) -> Result<Transaction, TransactionError> {
        let input_total = self.input_total.ok_or(TransactionError::InputOverflow)?;

        let mut outputs = Vec::new();
        match self.kind {
            TxKind::Transfer => {
                outputs.push(TransactionOutput {
                    wallet_id: self.recipient.clone(),
                    amount: self.amount,
                });
                let change = input_total.saturating_sub(self.amount.saturating_add(self.fee));
                if change > 0 {
                    outputs.push(TransactionOutput {
                        wallet_id: self.sender.clone(),
                        amount: change,
                    });
                }
            }
            TxKind::Levy => {
                let change = input_total.saturating_sub(self.amount);
                if change > 0 {
                    outputs.push(TransactionOutput {
                        wallet_id: self.sender.clone(),
                        amount: change,
                    });
                }
            }
            TxKind::Issuance => outputs.push(TransactionOutput {
                wallet_id: self.recipient.clone(),
                amount: self.amount,
            }),
        }

        Ok(Transaction {
            version: TX_VERSION,
            kind: self.kind,
            sender_wallet_id: self.sender,
            recipient_wallet_id: self.recipient,
            amount: self.amount,
            fee: self.fee,
            note: self.note,
            inputs: self.inputs,
            outputs,
            timestamp: self.timestamp,
            nonce: rand::random(),
            public_key: String::new(),
            signature: String::new(),
            hash: String::new(),
        })
    }

    /// Build and sign with the sender's key
    pub fn build_and_sign(self, key_pair: &KeyPair) -> Result<Transaction, TransactionError> {
        let mut tx = self.build()?;
        tx.sign(key_pair)?;
        Ok(tx)
    }
}
