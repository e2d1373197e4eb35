//! Transactions and transaction-related structures.
//!
//! A transaction on this network is either a regular value transfer or the
//! single synthetic coinbase of a block. Both share one wire layout (see
//! [`serialize`]) but are validated by completely different rules, so they
//! are modeled as a tagged variant.

mod coinbase;
mod hash;
mod input;
mod output;
mod serialize;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use crate::amount::Amount;
use crate::keys::InputSignature;
use crate::serialization::{DenaroSerialize, SerializationError};

pub use coinbase::CoinbaseTransaction;
pub use hash::Hash;
pub use input::TransactionInput;
pub use output::TransactionOutput;

use thiserror::Error;

/// The protocol version written into new regular transactions.
pub const VERSION: u8 = 3;

/// Longest message a version ≤ 2 transaction can carry.
pub const MAX_MESSAGE_LENGTH_V1: usize = 255;
/// Longest message a version 3 transaction can carry.
pub const MAX_MESSAGE_LENGTH_V3: usize = 65_535;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction spends the same output twice")]
    DuplicateInput,
    #[error("input is missing its signature")]
    MissingSignature,
    #[error("signature count does not match input key groups")]
    SignatureCountMismatch,
    #[error("input references an unknown transaction output")]
    UnknownRelatedOutput,
    #[error("signature verification failed")]
    BadSignature,
    #[error("output amount is zero")]
    ZeroAmountOutput,
    #[error("inputs are worth less than outputs")]
    InsufficientInputs,
    #[error("amount overflow")]
    AmountOverflow,
}

/// A parsed transaction: a regular transfer or a block's coinbase.
#[derive(Clone, Debug)]
pub enum Transaction {
    Regular(RegularTransaction),
    Coinbase(CoinbaseTransaction),
}

impl Transaction {
    /// Parses a transaction from its network hex form.
    pub fn from_hex(hex_string: &str) -> Result<Transaction, SerializationError> {
        serialize::transaction_from_hex(hex_string)
    }

    /// The full network hex form.
    pub fn hex(&self) -> String {
        match self {
            Transaction::Regular(tx) => tx.hex(),
            Transaction::Coinbase(tx) => tx.hex(),
        }
    }

    /// The transaction hash: SHA-256 over the serialized bytes.
    pub fn hash(&self) -> Hash {
        match self {
            Transaction::Regular(tx) => tx.hash(),
            Transaction::Coinbase(tx) => tx.hash(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    pub fn as_regular(&self) -> Option<&RegularTransaction> {
        match self {
            Transaction::Regular(tx) => Some(tx),
            Transaction::Coinbase(_) => None,
        }
    }

    /// The outputs of either variant, in output-index order.
    pub fn outputs(&self) -> Vec<TransactionOutput> {
        match self {
            Transaction::Regular(tx) => tx.outputs.clone(),
            Transaction::Coinbase(tx) => vec![tx.output()],
        }
    }
}

/// Two transactions are the same transaction exactly when their
/// serializations match.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hex() == other.hex()
    }
}

impl Eq for Transaction {}

/// A regular value transfer.
#[derive(Clone, Debug)]
pub struct RegularTransaction {
    /// 1 encodes full-hex output addresses, 3 compressed ones. 2 is never
    /// written by transactions; it marks compressed-address block headers.
    pub version: u8,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    /// Optional free-form payload carried on chain.
    pub message: Option<Vec<u8>>,
    /// Signatures parsed from the wire that could not be distributed to
    /// inputs yet: distribution by key group needs the referenced outputs,
    /// which only the store knows. See [`RegularTransaction::distribute_signatures`].
    pub undistributed_signatures: Vec<InputSignature>,
}

impl RegularTransaction {
    /// The hex of the unsigned prefix: version, inputs, outputs, and the
    /// message block when there is one. This is the exact ASCII string
    /// signatures are computed over.
    pub fn unsigned_hex(&self) -> String {
        hex::encode(serialize::serialize_body(self).expect("transaction fits the wire format"))
    }

    /// The full network hex form, with the deduplicated signature list.
    pub fn hex(&self) -> String {
        hex::encode(
            self.denaro_serialize_to_vec()
                .expect("transaction fits the wire format"),
        )
    }

    pub fn hash(&self) -> Hash {
        Hash::of_bytes(
            &self
                .denaro_serialize_to_vec()
                .expect("transaction fits the wire format"),
        )
    }

    /// Serialized size in hex characters, the unit all block size limits are
    /// expressed in.
    pub fn hex_length(&self) -> usize {
        self.hex().len()
    }

    /// Copies each input's referenced output out of `related`, keyed by the
    /// transaction hash the input points at.
    pub fn fill_inputs(
        &mut self,
        related: &HashMap<Hash, Transaction>,
    ) -> Result<(), TransactionError> {
        for input in &mut self.inputs {
            let transaction = related
                .get(&input.tx_hash)
                .ok_or(TransactionError::UnknownRelatedOutput)?;
            let output = transaction
                .outputs()
                .get(input.index as usize)
                .cloned()
                .ok_or(TransactionError::UnknownRelatedOutput)?;
            input.related_output = Some(output);
        }
        Ok(())
    }

    /// Assigns signatures held back at parse time to inputs, grouping inputs
    /// by their recovered public key in first-seen order and giving the i-th
    /// signature to the i-th group. Inputs must be filled first.
    pub fn distribute_signatures(&mut self) -> Result<(), TransactionError> {
        if self.undistributed_signatures.is_empty() {
            return Ok(());
        }
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, input) in self.inputs.iter().enumerate() {
            let key = input.public_key()?.to_full_hex();
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, members)) => members.push(i),
                None => groups.push((key, vec![i])),
            }
        }
        if self.undistributed_signatures.len() > groups.len() {
            return Err(TransactionError::SignatureCountMismatch);
        }
        let signatures = std::mem::take(&mut self.undistributed_signatures);
        for (signature, (_, members)) in signatures.into_iter().zip(&groups) {
            for &i in members {
                self.inputs[i].signature = Some(signature);
            }
        }
        Ok(())
    }

    /// Verifies the transaction against its filled inputs and returns the
    /// fee.
    ///
    /// Checks, in order: no duplicate (tx_hash, index) pair, every input
    /// signed with a valid signature over the unsigned prefix, no zero
    /// outputs, and input value covering output value. Signature checks are
    /// deduplicated per (public key, signature) pair.
    pub fn verify(&self) -> Result<Amount, TransactionError> {
        let message = self.unsigned_hex();
        let message = message.as_bytes();

        let mut seen_inputs: Vec<(Hash, u8)> = Vec::new();
        let mut checked: Vec<(String, InputSignature)> = Vec::new();
        let mut input_amount = Amount::ZERO;
        for input in &self.inputs {
            if seen_inputs.contains(&(input.tx_hash, input.index)) {
                return Err(TransactionError::DuplicateInput);
            }
            seen_inputs.push((input.tx_hash, input.index));

            let signature = input.signature.ok_or(TransactionError::MissingSignature)?;
            let public_key = input.public_key()?;
            let check = (public_key.to_full_hex(), signature);
            if !checked.contains(&check) {
                if !public_key.verify(message, &signature) {
                    return Err(TransactionError::BadSignature);
                }
                checked.push(check);
            }

            input_amount = input_amount
                .checked_add(input.related_output.as_ref().expect("checked by public_key").amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }

        let mut output_amount = Amount::ZERO;
        for output in &self.outputs {
            if output.amount.is_zero() {
                return Err(TransactionError::ZeroAmountOutput);
            }
            output_amount = output_amount
                .checked_add(output.amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }

        input_amount
            .checked_sub(output_amount)
            .ok_or(TransactionError::InsufficientInputs)
    }

    /// The fee without re-running signature checks; inputs must be filled.
    pub fn fee(&self) -> Result<Amount, TransactionError> {
        let mut input_amount = Amount::ZERO;
        for input in &self.inputs {
            let output = input
                .related_output
                .as_ref()
                .ok_or(TransactionError::UnknownRelatedOutput)?;
            input_amount = input_amount
                .checked_add(output.amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }
        let mut output_amount = Amount::ZERO;
        for output in &self.outputs {
            output_amount = output_amount
                .checked_add(output.amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }
        input_amount
            .checked_sub(output_amount)
            .ok_or(TransactionError::InsufficientInputs)
    }

    /// Signs every unsigned input that this key can spend. Used by tests and
    /// tooling; the node itself only verifies.
    pub fn sign(&mut self, key: &p256::ecdsa::SigningKey) {
        let message = self.unsigned_hex();
        let signature = crate::keys::sign(key, message.as_bytes());
        let address = crate::keys::address_for_key(key);
        for input in &mut self.inputs {
            let owned = input
                .related_output
                .as_ref()
                .map(|output| output.address == address)
                .unwrap_or(true);
            if input.signature.is_none() && owned {
                input.signature = Some(signature);
            }
        }
    }
}

impl PartialEq for RegularTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.hex() == other.hex()
    }
}

impl Eq for RegularTransaction {}
