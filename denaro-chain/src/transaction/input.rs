use crate::keys::{Address, InputSignature};
use crate::transaction::{Hash, TransactionError, TransactionOutput};

/// A reference to a previous transaction output, plus the signature that
/// spends it once signed.
#[derive(Clone, Debug)]
pub struct TransactionInput {
    /// Hash of the transaction holding the spent output.
    pub tx_hash: Hash,
    /// Which of that transaction's outputs is spent.
    pub index: u8,
    pub signature: Option<InputSignature>,
    /// The referenced output, once filled from the store. Not serialized.
    pub related_output: Option<TransactionOutput>,
}

impl TransactionInput {
    pub fn new(tx_hash: Hash, index: u8) -> TransactionInput {
        TransactionInput {
            tx_hash,
            index,
            signature: None,
            related_output: None,
        }
    }

    /// The (tx_hash, index) pair this input consumes.
    pub fn outpoint(&self) -> (Hash, u8) {
        (self.tx_hash, self.index)
    }

    /// The owner of the referenced output. Only available after
    /// [`fill_inputs`](crate::transaction::RegularTransaction::fill_inputs).
    pub fn public_key(&self) -> Result<&Address, TransactionError> {
        self.related_output
            .as_ref()
            .map(|output| &output.address)
            .ok_or(TransactionError::UnknownRelatedOutput)
    }
}
