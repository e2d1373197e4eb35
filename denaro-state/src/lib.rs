//! Durable chain state behind a narrow contract.
//!
//! The [`Store`] trait is the only way the rest of the node touches
//! committed blocks, transactions, the unspent-output set, and the pending
//! pool. The block pipeline and the sync machinery are injected with a
//! `Arc<dyn Store>`, which breaks the manager ↔ store ↔ transaction cycle
//! of the original design. [`SledStore`] is the production implementation.

pub mod mempool;
mod sled_state;

pub use sled_state::SledStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use denaro_chain::amount::Amount;
use denaro_chain::block::{self, BlockRecord};
use denaro_chain::keys::Address;
use denaro_chain::transaction::{self, CoinbaseTransaction, RegularTransaction, Transaction};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A state store error.
#[derive(displaydoc::Display, Error, Debug)]
pub enum StateError {
    /// transaction is already pending
    AlreadyPresent,
    /// block {0} does not extend the committed chain
    OutOfOrderBlock(u32),
    /// store is corrupted: {0}
    Corrupt(&'static str),
}

/// The composite (tx_hash, index) key identifying one transaction output.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_hash: transaction::Hash,
    pub index: u8,
}

impl OutputRef {
    pub fn new(tx_hash: transaction::Hash, index: u8) -> OutputRef {
        OutputRef { tx_hash, index }
    }

    /// The 33-byte key used by the unspent and pending-spent trees; its
    /// byte order is the canonical (tx_hash, index) ordering.
    pub fn key(&self) -> [u8; 33] {
        let mut key = [0u8; 33];
        key[..32].copy_from_slice(self.tx_hash.as_bytes());
        key[32] = self.index;
        key
    }

    /// The hex fragment `tx_hash ‖ index` as it appears inside a serialized
    /// transaction that spends this output.
    pub fn hex_fragment(&self) -> String {
        format!("{}{:02x}", self.tx_hash, self.index)
    }

    /// Every output a transaction's inputs consume.
    pub fn spent_by(tx: &RegularTransaction) -> Vec<OutputRef> {
        tx.inputs
            .iter()
            .map(|input| OutputRef::new(input.tx_hash, input.index))
            .collect()
    }
}

/// A block together with the hex of its transactions, the shape peers
/// exchange in bulk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockWithTransactions {
    pub block: BlockRecord,
    pub transactions: Vec<String>,
}

/// One pending-pool row: the parsed transaction and the fee it pays.
#[derive(Clone, Debug)]
pub struct PendingEntry {
    pub transaction: RegularTransaction,
    pub fees: Amount,
}

/// The single source of truth for committed chain state.
///
/// Implementations must make [`Store::commit_block`] and
/// [`Store::delete_blocks_above`] atomic with respect to readers: a reader
/// sees the pre-state or the post-state, never half a commit.
pub trait Store: Send + Sync {
    // --- blocks ---

    /// The id the next committed block must carry (1 on an empty chain).
    fn next_block_id(&self) -> Result<u32, BoxError>;
    fn get_last_block(&self) -> Result<Option<BlockRecord>, BoxError>;
    fn get_block_by_id(&self, id: u32) -> Result<Option<BlockRecord>, BoxError>;
    fn get_block_by_hash(&self, hash: &block::Hash) -> Result<Option<BlockRecord>, BoxError>;
    /// Blocks with `id >= offset`, ascending, at most `limit` of them.
    fn get_blocks(&self, offset: u32, limit: u32) -> Result<Vec<BlockWithTransactions>, BoxError>;
    /// A block's transactions, coinbase first, regulars replayed in the
    /// miner-chosen order when one was recorded.
    fn get_block_transactions(&self, hash: &block::Hash) -> Result<Vec<Transaction>, BoxError>;

    /// Commits a validated block: inserts the block row, its coinbase and
    /// transactions, and the new unspent outputs; removes the spent outputs
    /// and the embedded transactions' pending rows. All or nothing.
    fn commit_block(
        &self,
        block: &BlockRecord,
        coinbase: &CoinbaseTransaction,
        transactions: &[RegularTransaction],
    ) -> Result<(), BoxError>;

    /// The reorg primitive: removes every block with `id > id`, cascading
    /// to their transactions and those transactions' unspent outputs.
    /// Outputs the removed blocks had spent are *not* restored; the caller
    /// owns that (it also owns re-admitting the removed transactions).
    fn delete_blocks_above(&self, id: u32) -> Result<(), BoxError>;

    // --- transactions ---

    fn get_transaction(&self, hash: &transaction::Hash) -> Result<Option<Transaction>, BoxError>;
    fn get_transactions(
        &self,
        hashes: &[transaction::Hash],
    ) -> Result<HashMap<transaction::Hash, Transaction>, BoxError>;
    /// Whether any committed transaction's hex contains one of `fragments`.
    /// Legacy escape hatch used by the ≤ 5 conflicting-outputs exception.
    fn find_transaction_containing(
        &self,
        fragments: &[String],
    ) -> Result<Option<transaction::Hash>, BoxError>;
    fn get_address_transactions(
        &self,
        address: &Address,
        limit: usize,
    ) -> Result<Vec<Transaction>, BoxError>;

    // --- unspent outputs ---

    /// The subset of `refs` that is currently unspent: the primary
    /// double-spend test.
    fn get_unspent_outputs(&self, refs: &[OutputRef]) -> Result<Vec<OutputRef>, BoxError>;
    /// Re-inserts outputs into the unspent set (reorg rollback path).
    fn add_unspent_outputs(&self, refs: &[OutputRef]) -> Result<(), BoxError>;
    /// SHA-256 over all (tx_hash, index) keys in ascending order; peers use
    /// it to compare tips cheaply.
    fn get_unspent_outputs_hash(&self) -> Result<String, BoxError>;
    fn get_address_spendable_outputs(
        &self,
        address: &Address,
    ) -> Result<Vec<(OutputRef, Amount)>, BoxError>;
    /// Recomputes the whole unspent set from the committed chain; returns
    /// how many outputs it found.
    fn rebuild_unspent_outputs(&self) -> Result<usize, BoxError>;

    // --- pending pool ---

    /// Inserts a verified transaction and its spent-output markers.
    fn insert_pending_transaction(
        &self,
        tx: &RegularTransaction,
        fees: Amount,
    ) -> Result<(), BoxError>;
    fn get_pending_transaction(
        &self,
        hash: &transaction::Hash,
    ) -> Result<Option<RegularTransaction>, BoxError>;
    fn get_pending_entries(&self) -> Result<Vec<PendingEntry>, BoxError>;
    fn get_pending_transactions_by_hash(
        &self,
        hashes: &[transaction::Hash],
    ) -> Result<Vec<RegularTransaction>, BoxError>;
    fn remove_pending_transactions(&self, hashes: &[transaction::Hash]) -> Result<(), BoxError>;
    fn clear_pending_pool(&self) -> Result<(), BoxError>;
    /// The subset of `refs` already referenced by a pending transaction:
    /// the mempool conflict test.
    fn get_pending_spent_outputs(&self, refs: &[OutputRef]) -> Result<Vec<OutputRef>, BoxError>;
    fn get_address_pending_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<RegularTransaction>, BoxError>;
    fn get_address_pending_spent_outputs(
        &self,
        address: &Address,
    ) -> Result<Vec<OutputRef>, BoxError>;
}
