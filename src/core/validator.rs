//! Transaction validation against a trial view of the UTXO set
//!
//! Checks run in a fixed order and the first failure decides the
//! [`Rejection`]:
//!
//! 1. amount is positive and amount + fee is representable
//! 2. every input exists, belongs to the sender and is unspent
//! 3. the signature verifies for the sender's key
//! 4. inputs cover amount + fee and the outputs route change back
//! 5. no input is used twice in the transaction or the pending batch

use crate::core::amount::Amount;
use crate::core::transaction::{Transaction, TransactionOutput, TxKind, LEVY_SINK};
use crate::core::utxo::TrialView;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Why a transaction was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rejection {
    #[error("inputs do not cover the amount and fee")]
    InsufficientFunds,
    #[error("signature does not verify for the sender")]
    InvalidSignature,
    #[error("an input is already spent or reserved")]
    DoubleSpend,
    #[error("an input does not exist or is not owned by the sender")]
    UnknownInput,
    #[error("amount is zero, out of range or has too many decimal places")]
    MalformedAmount,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::InsufficientFunds => "InsufficientFunds",
            Rejection::InvalidSignature => "InvalidSignature",
            Rejection::DoubleSpend => "DoubleSpend",
            Rejection::UnknownInput => "UnknownInput",
            Rejection::MalformedAmount => "MalformedAmount",
        }
    }
}

/// A transaction that passed validation, with the ids of the UTXOs it creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    tx: Transaction,
    output_ids: Vec<String>,
}

impl ValidatedTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn hash(&self) -> &str {
        &self.tx.hash
    }

    pub fn output_ids(&self) -> &[String] {
        &self.output_ids
    }

    pub fn into_inner(self) -> Transaction {
        self.tx
    }
}

/// Stateless validator parameterised by the ledger's fee and issuing authority
#[derive(Debug, Clone, Default)]
pub struct Validator {
    /// Fee every transfer must carry
    transfer_fee: Amount,
    /// Only wallet allowed to sign issuance transactions
    issuer: Option<String>,
}

impl Validator {
    pub fn new(transfer_fee: Amount) -> Self {
        Self {
            transfer_fee,
            issuer: None,
        }
    }

    pub fn with_issuer(mut self, issuer_wallet_id: &str) -> Self {
        self.issuer = Some(issuer_wallet_id.to_string());
        self
    }

    pub fn transfer_fee(&self) -> Amount {
        self.transfer_fee
    }

    /// Validate `tx` against `view` without changing it
    pub fn validate(
        &self,
        tx: &Transaction,
        view: &TrialView<'_>,
    ) -> Result<ValidatedTransaction, Rejection> {
        self.check_amount(tx)?;
        let input_total = self.check_inputs(tx, view)?;
        self.check_signature(tx)?;
        self.check_balance(tx, input_total)?;
        self.check_double_spend(tx, view)?;

        Ok(ValidatedTransaction {
            output_ids: tx.output_ids(),
            tx: tx.clone(),
        })
    }

    /// Validate and, on success, reserve the inputs in the view
    pub fn admit(
        &self,
        tx: &Transaction,
        view: &mut TrialView<'_>,
    ) -> Result<ValidatedTransaction, Rejection> {
        let validated = self.validate(tx, view)?;
        view.apply(validated.transaction());
        Ok(validated)
    }

    fn check_amount(&self, tx: &Transaction) -> Result<(), Rejection> {
        if tx.amount == 0 {
            return Err(Rejection::MalformedAmount);
        }
        let required_fee = match tx.kind {
            TxKind::Transfer => self.transfer_fee,
            TxKind::Levy | TxKind::Issuance => 0,
        };
        if tx.fee != required_fee {
            return Err(Rejection::MalformedAmount);
        }
        tx.amount
            .checked_add(tx.fee)
            .map(|_| ())
            .ok_or(Rejection::MalformedAmount)
    }

    /// Returns the sum of the inputs
    fn check_inputs(&self, tx: &Transaction, view: &TrialView<'_>) -> Result<Amount, Rejection> {
        if tx.kind == TxKind::Issuance && !tx.inputs.is_empty() {
            return Err(Rejection::MalformedAmount);
        }

        let mut total: Amount = 0;
        for input in &tx.inputs {
            let utxo = view.get(input).ok_or(Rejection::UnknownInput)?;
            if utxo.wallet_id != tx.sender_wallet_id {
                return Err(Rejection::UnknownInput);
            }
            if !utxo.is_unspent() {
                return Err(Rejection::DoubleSpend);
            }
            total = total
                .checked_add(utxo.amount)
                .ok_or(Rejection::MalformedAmount)?;
        }
        Ok(total)
    }

    fn check_signature(&self, tx: &Transaction) -> Result<(), Rejection> {
        if tx.kind == TxKind::Issuance && self.issuer.as_deref() != Some(tx.sender_wallet_id.as_str())
        {
            return Err(Rejection::InvalidSignature);
        }
        if !tx.verify_signature() {
            return Err(Rejection::InvalidSignature);
        }
        Ok(())
    }

    fn check_balance(&self, tx: &Transaction, input_total: Amount) -> Result<(), Rejection> {
        let expected = match tx.kind {
            TxKind::Transfer => {
                let required = tx.amount + tx.fee;
                if input_total < required {
                    return Err(Rejection::InsufficientFunds);
                }
                let mut outputs = vec![TransactionOutput {
                    wallet_id: tx.recipient_wallet_id.clone(),
                    amount: tx.amount,
                }];
                push_change(&mut outputs, &tx.sender_wallet_id, input_total - required);
                outputs
            }
            TxKind::Levy => {
                if input_total < tx.amount {
                    return Err(Rejection::InsufficientFunds);
                }
                if tx.recipient_wallet_id != LEVY_SINK {
                    return Err(Rejection::MalformedAmount);
                }
                let mut outputs = Vec::new();
                push_change(&mut outputs, &tx.sender_wallet_id, input_total - tx.amount);
                outputs
            }
            TxKind::Issuance => vec![TransactionOutput {
                wallet_id: tx.recipient_wallet_id.clone(),
                amount: tx.amount,
            }],
        };

        if tx.outputs != expected {
            return Err(Rejection::MalformedAmount);
        }
        Ok(())
    }

    fn check_double_spend(&self, tx: &Transaction, view: &TrialView<'_>) -> Result<(), Rejection> {
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            if !seen.insert(input.as_str()) || view.is_reserved(input) {
                return Err(Rejection::DoubleSpend);
            }
        }
        Ok(())
    }
}

fn push_change(outputs: &mut Vec<TransactionOutput>, sender: &str, change: Amount) {
    if change > 0 {
        outputs.push(TransactionOutput {
            wallet_id: sender.to_string(),
            amount: change,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::core::transaction::TransactionBuilder;
    use crate::core::utxo::{Utxo, UtxoSet};
    use crate::crypto::KeyPair;

    struct Fixture {
        treasury: KeyPair,
        alice: KeyPair,
        bob: KeyPair,
        set: UtxoSet,
    }

    impl Fixture {
        fn new(alice_funds: &[Amount]) -> Self {
            let treasury = KeyPair::generate();
            let alice = KeyPair::generate();
            let bob = KeyPair::generate();
            let issues = alice_funds
                .iter()
                .map(|amount| {
                    TransactionBuilder::issuance(&treasury.wallet_id(), &alice.wallet_id(), *amount)
                        .build_and_sign(&treasury)
                        .unwrap()
                })
                .collect();
            let block = Block::new(1, Block::genesis().hash, issues, 0);
            let mut set = UtxoSet::new();
            set.commit(&block).unwrap();
            Self {
                treasury,
                alice,
                bob,
                set,
            }
        }

        fn validator(&self) -> Validator {
            Validator::new(0).with_issuer(&self.treasury.wallet_id())
        }

        fn alice_utxos(&self) -> Vec<Utxo> {
            self.set
                .unspent_of(&self.alice.wallet_id())
                .into_iter()
                .cloned()
                .collect()
        }

        fn transfer(&self, amount: Amount, inputs: &[Utxo]) -> Transaction {
            inputs
                .iter()
                .fold(
                    TransactionBuilder::transfer(&self.alice.wallet_id(), &self.bob.wallet_id(), amount),
                    |builder, utxo| builder.add_input(utxo),
                )
                .build_and_sign(&self.alice)
                .unwrap()
        }
    }

    #[test]
    fn test_valid_transfer() {
        let fx = Fixture::new(&[100]);
        let tx = fx.transfer(30, &fx.alice_utxos());

        let validated = fx.validator().validate(&tx, &fx.set.begin_trial()).unwrap();
        assert_eq!(validated.hash(), tx.hash);
        assert_eq!(validated.output_ids().len(), 2);
    }

    #[test]
    fn test_zero_amount_is_malformed() {
        let fx = Fixture::new(&[100]);
        let tx = fx.transfer(0, &fx.alice_utxos());
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::MalformedAmount)
        );
    }

    #[test]
    fn test_unknown_input() {
        let fx = Fixture::new(&[100]);
        let ghost = Utxo::unspent("00:7".to_string(), &fx.alice.wallet_id(), 100, "x");
        let tx = fx.transfer(30, &[ghost]);
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::UnknownInput)
        );
    }

    #[test]
    fn test_foreign_input_is_unknown_to_sender() {
        let fx = Fixture::new(&[100]);
        let utxo = fx.alice_utxos().remove(0);
        let tx = TransactionBuilder::transfer(&fx.bob.wallet_id(), &fx.alice.wallet_id(), 10)
            .add_input(&utxo)
            .build_and_sign(&fx.bob)
            .unwrap();
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::UnknownInput)
        );
    }

    #[test]
    fn test_bad_signature() {
        let fx = Fixture::new(&[100]);
        let mut tx = fx.transfer(30, &fx.alice_utxos());
        tx.signature = hex::encode([7u8; 64]);
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::InvalidSignature)
        );
    }

    #[test]
    fn test_insufficient_funds() {
        let fx = Fixture::new(&[100]);
        let tx = fx.transfer(101, &fx.alice_utxos());
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::InsufficientFunds)
        );
    }

    #[test]
    fn test_fee_is_required() {
        let fx = Fixture::new(&[100]);
        let validator = Validator::new(2).with_issuer(&fx.treasury.wallet_id());

        let no_fee = fx.transfer(30, &fx.alice_utxos());
        assert_eq!(
            validator.validate(&no_fee, &fx.set.begin_trial()),
            Err(Rejection::MalformedAmount)
        );

        let with_fee = TransactionBuilder::transfer(&fx.alice.wallet_id(), &fx.bob.wallet_id(), 30)
            .fee(2)
            .add_input(&fx.alice_utxos()[0])
            .build_and_sign(&fx.alice)
            .unwrap();
        assert_eq!(with_fee.outputs[1].amount, 68);
        assert!(validator.validate(&with_fee, &fx.set.begin_trial()).is_ok());
    }

    #[test]
    fn test_outputs_must_return_change_to_sender() {
        let fx = Fixture::new(&[100]);
        let mut tx = fx.transfer(30, &fx.alice_utxos());
        tx.outputs[1].wallet_id = fx.bob.wallet_id();
        tx.sign(&fx.alice).unwrap();
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::MalformedAmount)
        );
    }

    #[test]
    fn test_input_repeated_within_transaction() {
        let fx = Fixture::new(&[100]);
        let utxo = fx.alice_utxos().remove(0);
        let tx = fx.transfer(150, &[utxo.clone(), utxo]);
        assert_eq!(
            fx.validator().validate(&tx, &fx.set.begin_trial()),
            Err(Rejection::DoubleSpend)
        );
    }

    #[test]
    fn test_batch_double_spend_keeps_first() {
        let fx = Fixture::new(&[100]);
        let utxos = fx.alice_utxos();
        let first = fx.transfer(30, &utxos);
        let second = fx.transfer(40, &utxos);

        let validator = fx.validator();
        let mut view = fx.set.begin_trial();
        assert!(validator.admit(&first, &mut view).is_ok());
        assert_eq!(validator.admit(&second, &mut view), Err(Rejection::DoubleSpend));
    }

    #[test]
    fn test_spent_input_is_double_spend() {
        let mut fx = Fixture::new(&[100]);
        let utxos = fx.alice_utxos();
        let first = fx.transfer(30, &utxos);
        let block = Block::new(2, "0".repeat(64), vec![first], 0);
        fx.set.commit(&block).unwrap();

        let again = fx.transfer(30, &utxos);
        assert_eq!(
            fx.validator().validate(&again, &fx.set.begin_trial()),
            Err(Rejection::DoubleSpend)
        );
    }

    #[test]
    fn test_rejection_leaves_set_untouched() {
        let fx = Fixture::new(&[100]);
        let before = fx.set.clone();
        let tx = fx.transfer(500, &fx.alice_utxos());

        let mut view = fx.set.begin_trial();
        assert!(fx.validator().admit(&tx, &mut view).is_err());
        assert!(!view.is_reserved(&fx.alice_utxos()[0].id));
        assert_eq!(fx.set, before);
    }

    #[test]
    fn test_levy_shape() {
        let fx = Fixture::new(&[1000]);
        let levy = TransactionBuilder::levy(&fx.alice.wallet_id(), 25)
            .add_input(&fx.alice_utxos()[0])
            .build_and_sign(&fx.alice)
            .unwrap();
        assert!(fx.validator().validate(&levy, &fx.set.begin_trial()).is_ok());

        let mut redirected = levy.clone();
        redirected.recipient_wallet_id = fx.bob.wallet_id();
        redirected.sign(&fx.alice).unwrap();
        assert_eq!(
            fx.validator().validate(&redirected, &fx.set.begin_trial()),
            Err(Rejection::MalformedAmount)
        );
    }

    #[test]
    fn test_issuance_requires_issuer() {
        let fx = Fixture::new(&[]);
        let rogue = KeyPair::generate();
        let forged = TransactionBuilder::issuance(&rogue.wallet_id(), &rogue.wallet_id(), 1_000)
            .build_and_sign(&rogue)
            .unwrap();
        assert_eq!(
            fx.validator().validate(&forged, &fx.set.begin_trial()),
            Err(Rejection::InvalidSignature)
        );

        let genuine = TransactionBuilder::issuance(&fx.treasury.wallet_id(), &fx.bob.wallet_id(), 1_000)
            .build_and_sign(&fx.treasury)
            .unwrap();
        assert!(fx.validator().validate(&genuine, &fx.set.begin_trial()).is_ok());
    }
}
