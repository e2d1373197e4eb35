//! Chain synchronization and reorganization.
//!
//! Triggered on startup, on a missing-predecessor at block ingest, or on
//! request. The node walks back through the last 500 blocks to find the
//! first hash shared with the remote, rolls its own chain back to that
//! ancestor (restoring spent outputs and re-admitting the removed
//! transactions to the pool), then pulls the remote chain forward in
//! chunks of up to 1000 blocks through the regular block pipeline. If the
//! remote chain stops validating after a reorg, the locally cached suffix
//! is reapplied.

use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

use denaro_chain::block::{self, merkle, BlockContent};
use denaro_chain::keys::address_string_to_bytes;
use denaro_chain::parameters::{checkpoint, SORTED_MERKLE_HEIGHT};
use denaro_chain::serialization::SerializationError;
use denaro_chain::transaction::{RegularTransaction, Transaction};
use denaro_chain::DenaroSerialize;
use denaro_consensus::{BlockError, ChainManager};
use denaro_state::{mempool, BlockWithTransactions, BoxError, OutputRef};

use crate::client::{NodeInterface, PeerError, RemoteBlock, RemoteBlockResponse};
use crate::registry::NodeRegistry;

/// How many blocks are fetched per sync chunk.
const SYNC_CHUNK: u32 = 1000;

/// Window walked back when looking for a common ancestor.
const ANCESTOR_WINDOW: u32 = 500;

/// Old-block transaction-order recovery gives up beyond this many
/// transactions (the search is factorial).
const MAX_ORDER_SEARCH: usize = 7;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadySyncing,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("block rejected during sync: {0}")]
    Block(#[from] BlockError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("peer sent block {got} where {expected} was expected")]
    IdMismatch { expected: u32, got: u32 },
    #[error("store error: {0}")]
    Store(BoxError),
}

impl From<BoxError> for SyncError {
    fn from(e: BoxError) -> Self {
        SyncError::Store(e)
    }
}

pub struct ChainSync {
    manager: Arc<ChainManager>,
    registry: Arc<NodeRegistry>,
    /// Our own URL once a peer's request taught it to us.
    self_url: Mutex<Option<String>>,
    /// Single-flight guard: one sync per process.
    sync_lock: tokio::sync::Mutex<()>,
}

impl ChainSync {
    pub fn new(manager: Arc<ChainManager>, registry: Arc<NodeRegistry>) -> ChainSync {
        ChainSync {
            manager,
            registry,
            self_url: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ChainManager> {
        &self.manager
    }

    pub fn set_self_url(&self, url: String) {
        *self.self_url.lock().expect("self url lock is never poisoned") =
            Some(url.trim_end_matches('/').to_string());
    }

    pub fn self_url(&self) -> Option<String> {
        self.self_url
            .lock()
            .expect("self url lock is never poisoned")
            .clone()
    }

    /// Synchronizes against `node_url`, or a random recent peer. On
    /// success the contacted peer is promoted.
    pub async fn sync_blockchain(&self, node_url: Option<String>) -> Result<(), SyncError> {
        let _guard = self
            .sync_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        let result = self.sync_inner(node_url.clone()).await;
        match &result {
            Ok(()) => {
                if let Some(url) = node_url {
                    self.registry.update_last_contact(&url);
                }
            }
            Err(e) => warn!(%e, "blockchain sync failed"),
        }
        result
    }

    async fn sync_inner(&self, node_url: Option<String>) -> Result<(), SyncError> {
        let node_url = match node_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let recent = self.registry.get_recent_nodes();
                match recent.choose(&mut rand::thread_rng()) {
                    Some(url) => url.clone(),
                    None => return Ok(()),
                }
            }
        };
        info!(%node_url, "syncing blockchain");
        metrics::counter!("network.sync.runs", 1);
        let node = NodeInterface::new(&node_url, self.self_url());
        let store = self.manager.store().clone();

        // (common ancestor id, our rolled-back suffix) when a reorg ran
        let mut reorg: Option<(u32, Vec<BlockWithTransactions>)> = None;

        if let Some(last_block) = store.get_last_block()? {
            if last_block.id > ANCESTOR_WINDOW {
                let remote_tip = node.get_block(last_block.id).await?;
                if remote_tip.block.hash != last_block.hash {
                    reorg = self.rollback_to_common_ancestor(&node, last_block.id).await?;
                    if reorg.is_none() {
                        return Ok(());
                    }
                }
            }
        }

        loop {
            let next_id = store.next_block_id()?;
            let blocks = node.get_blocks(next_id, SYNC_CHUNK).await?;
            if blocks.is_empty() {
                info!("syncing complete");
                return Ok(());
            }
            if let Err(e) = self.create_blocks(&blocks).await {
                if let Some((ancestor_id, suffix)) = &reorg {
                    warn!(%e, "remote chain stopped validating, restoring the local suffix");
                    store.delete_blocks_above(*ancestor_id)?;
                    self.manager.invalidate_difficulty();
                    let restored: Vec<RemoteBlockResponse> =
                        suffix.iter().map(local_to_remote).collect();
                    self.create_blocks(&restored).await?;
                }
                return Err(e);
            }
        }
    }

    /// Finds the first shared hash in the last [`ANCESTOR_WINDOW`] blocks
    /// and rolls the local chain back to it. Returns `None` when no reorg
    /// should happen (we are longer, or no ancestor was found).
    async fn rollback_to_common_ancestor(
        &self,
        node: &NodeInterface,
        local_tip: u32,
    ) -> Result<Option<(u32, Vec<BlockWithTransactions>)>, SyncError> {
        let store = self.manager.store().clone();
        let offset = local_tip + 1 - ANCESTOR_WINDOW;
        let remote_blocks = node.get_blocks(offset, ANCESTOR_WINDOW).await?;
        let local_blocks = store.get_blocks(offset, ANCESTOR_WINDOW)?;
        if local_blocks.len() > remote_blocks.len() {
            debug!("remote window is shorter than ours, staying on our chain");
            return Ok(None);
        }

        // newest-first scan for the first shared hash
        let mut ancestor = None;
        for (n, local_block) in local_blocks.iter().rev().enumerate() {
            let remote_block = &remote_blocks[remote_blocks.len() - 1 - n];
            if local_block.block.hash == remote_block.block.hash {
                ancestor = Some((n, local_block.block.id));
                break;
            }
        }
        let (above, ancestor_id) = match ancestor {
            Some(found) => found,
            None => {
                debug!("no common ancestor in the window, staying on our chain");
                return Ok(None);
            }
        };
        let suffix = local_blocks[local_blocks.len() - above..].to_vec();

        // everything above the ancestor goes: restore the outputs those
        // blocks had spent, then hand their transactions back to the pool
        let removed_blocks = store.get_blocks(ancestor_id + 1, ANCESTOR_WINDOW)?;
        let mut removed_transactions = Vec::new();
        for removed in &removed_blocks {
            for tx_hex in &removed.transactions {
                removed_transactions.push(Transaction::from_hex(tx_hex)?);
            }
        }
        let mut used_outputs = Vec::new();
        for tx in &removed_transactions {
            if let Some(tx) = tx.as_regular() {
                used_outputs.extend(OutputRef::spent_by(tx));
            }
        }

        store.delete_blocks_above(ancestor_id)?;
        store.add_unspent_outputs(&used_outputs)?;
        self.manager.invalidate_difficulty();
        for tx in removed_transactions {
            if let Transaction::Regular(tx) = tx {
                // signatures are re-verified on the way back in
                if let Err(e) = mempool::add_pending_transaction(&*store, tx) {
                    debug!(%e, "rolled-back transaction was not re-admitted");
                }
            }
        }

        metrics::counter!("network.sync.reorgs", 1);
        info!(
            ancestor = ancestor_id,
            removed = removed_blocks.len(),
            "rolled back to the common ancestor"
        );
        Ok(Some((ancestor_id, suffix)))
    }

    /// Rebuilds each remote block's header locally and feeds it through
    /// the pipeline.
    async fn create_blocks(&self, blocks: &[RemoteBlockResponse]) -> Result<(), SyncError> {
        let store = self.manager.store().clone();
        let mut last_view = store.get_last_block()?;
        for block_info in blocks {
            let expected_id = last_view.as_ref().map(|b| b.id + 1).unwrap_or(1);
            let remote = &block_info.block;
            if remote.id != expected_id {
                return Err(SyncError::IdMismatch {
                    expected: expected_id,
                    got: remote.id,
                });
            }

            let mut regulars = Vec::new();
            for tx_hex in &block_info.transactions {
                match Transaction::from_hex(tx_hex)? {
                    Transaction::Regular(tx) => regulars.push(tx),
                    // the pipeline mints its own coinbase
                    Transaction::Coinbase(_) => {}
                }
            }

            let previous_hash = last_view
                .as_ref()
                .map(|b| b.hash)
                .unwrap_or_else(block::genesis_previous_hash);
            let mut content = BlockContent {
                previous_hash,
                address_bytes: address_string_to_bytes(&remote.address)?,
                merkle_root: merkle_for(expected_id, &regulars)?,
                timestamp: remote.timestamp,
                difficulty: remote.difficulty,
                nonce: remote.random,
            };

            // Bulk responses do not preserve the miner's transaction
            // order, which old blocks' merkle roots depend on; search for
            // an order that reproduces the recorded hash.
            if expected_id < SORTED_MERKLE_HEIGHT
                && expected_id != checkpoint::HEIGHT
                && regulars.len() > 1
                && content.hash() != remote.hash
            {
                if let Some(ordered) = recover_miner_order(&regulars, &mut content, &remote.hash) {
                    regulars = ordered;
                }
            }

            let record = self
                .manager
                .create_block(&content.to_hex(), regulars, last_view.clone())?;
            last_view = Some(record);
        }
        Ok(())
    }
}

fn merkle_for(
    block_no: u32,
    transactions: &[RegularTransaction],
) -> Result<merkle::Root, SerializationError> {
    let serialized: Result<Vec<Vec<u8>>, _> = transactions
        .iter()
        .map(|tx| tx.denaro_serialize_to_vec())
        .collect();
    let serialized = serialized?;
    Ok(if block_no >= SORTED_MERKLE_HEIGHT {
        merkle::root_sorted(&serialized)
    } else {
        merkle::root_ordered(&serialized)
    })
}

fn local_to_remote(local: &BlockWithTransactions) -> RemoteBlockResponse {
    RemoteBlockResponse {
        block: RemoteBlock {
            id: local.block.id,
            hash: local.block.hash,
            address: local.block.address.clone(),
            random: local.block.random,
            difficulty: local.block.difficulty,
            reward: local.block.reward,
            timestamp: local.block.timestamp,
        },
        transactions: local.transactions.clone(),
    }
}

/// Tries every transaction order until the rebuilt header hashes to the
/// recorded block hash. Factorial, so bounded to small blocks; miners
/// rarely packed more into the legacy era.
fn recover_miner_order(
    transactions: &[RegularTransaction],
    content: &mut BlockContent,
    expected: &block::Hash,
) -> Option<Vec<RegularTransaction>> {
    if transactions.len() > MAX_ORDER_SEARCH {
        warn!(
            count = transactions.len(),
            "giving up on miner-order recovery, too many transactions"
        );
        return None;
    }
    let serialized: Vec<Vec<u8>> = transactions
        .iter()
        .map(|tx| {
            tx.denaro_serialize_to_vec()
                .expect("parsed transactions reserialize")
        })
        .collect();
    for order in permutations(transactions.len()) {
        let bytes: Vec<Vec<u8>> = order.iter().map(|&i| serialized[i].clone()).collect();
        content.merkle_root = merkle::root_ordered(&bytes);
        if content.hash() == *expected {
            return Some(order.iter().map(|&i| transactions[i].clone()).collect());
        }
    }
    None
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut result = Vec::new();
    for rest in permutations(n - 1) {
        for position in 0..=rest.len() {
            let mut next = rest.clone();
            next.insert(position, n - 1);
            result.push(next);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutations_cover_the_space() {
        assert_eq!(permutations(0).len(), 1);
        assert_eq!(permutations(3).len(), 6);
        let all = permutations(3);
        assert!(all.contains(&vec![0, 1, 2]));
        assert!(all.contains(&vec![2, 1, 0]));
    }

    #[test]
    fn miner_order_recovery_finds_the_recorded_order() {
        let tx_a = RegularTransaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            message: Some(b"a".to_vec()),
            undistributed_signatures: Vec::new(),
        };
        let tx_b = RegularTransaction {
            message: Some(b"b".to_vec()),
            ..tx_a.clone()
        };

        // the "miner" packed [b, a]; we only know {a, b}
        let miner_order = [
            tx_b.denaro_serialize_to_vec().unwrap(),
            tx_a.denaro_serialize_to_vec().unwrap(),
        ];
        let mut content = BlockContent {
            previous_hash: block::genesis_previous_hash(),
            address_bytes: vec![0u8; 64],
            merkle_root: merkle::root_ordered(&miner_order),
            timestamp: 1_600_000_000,
            difficulty: "6.0".parse().unwrap(),
            nonce: 1,
        };
        let recorded_hash = content.hash();

        let shuffled = vec![tx_a.clone(), tx_b.clone()];
        content.merkle_root = merkle::root_ordered(&[
            tx_a.denaro_serialize_to_vec().unwrap(),
            tx_b.denaro_serialize_to_vec().unwrap(),
        ]);
        assert_ne!(content.hash(), recorded_hash);

        let recovered = recover_miner_order(&shuffled, &mut content, &recorded_hash)
            .expect("order is recoverable");
        assert_eq!(recovered[0], tx_b);
        assert_eq!(recovered[1], tx_a);
        assert_eq!(content.hash(), recorded_hash);
    }
}
