use thiserror::Error;

use denaro_chain::serialization::SerializationError;
use denaro_chain::transaction::TransactionError;
use denaro_state::BoxError;

/// Why a candidate block was rejected. No state changes when any of these
/// comes back.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("proof of work does not satisfy the difficulty target")]
    InvalidProofOfWork,
    #[error("header difficulty does not match the current target")]
    WrongDifficulty,
    #[error("block does not extend the current tip")]
    WrongPreviousHash,
    #[error("block timestamp is not after its parent's")]
    TimestampNotMonotonic,
    #[error("block timestamp is in the future")]
    TimestampInFuture,
    #[error("block transactions exceed the block size limit")]
    OversizedBlock,
    #[error("block double-spends a transaction output")]
    DoubleSpend,
    #[error("merkle root does not match the block transactions")]
    BadMerkleRoot,
    #[error("coinbase output failed verification")]
    BadCoinbase,
    #[error("block does not match the checkpoint at its height")]
    CheckpointMismatch,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("store error: {0}")]
    Store(BoxError),
}

impl From<BoxError> for BlockError {
    fn from(e: BoxError) -> Self {
        BlockError::Store(e)
    }
}
