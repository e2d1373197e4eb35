//! The pending-pool manager: admission, miner ordering, and scrubbing.

use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use denaro_chain::block::MAX_BLOCK_SIZE_HEX;
use denaro_chain::transaction::{self, RegularTransaction, TransactionError};

use crate::{BoxError, OutputRef, PendingEntry, Store};

/// Minimum seconds between two scrubbing passes over the pool.
pub const SCRUB_COOLDOWN_SECS: u32 = 600;

#[derive(Error, Debug)]
pub enum MempoolError {
    /// The transaction is already pending or already committed. Idempotent
    /// success for gossip, an error for direct submitters.
    #[error("transaction is already present")]
    AlreadyPresent,
    #[error("transaction inputs are spent or contested")]
    DoubleSpend,
    #[error(transparent)]
    Invalid(#[from] TransactionError),
    #[error("store error: {0}")]
    Store(BoxError),
}

impl From<BoxError> for MempoolError {
    fn from(e: BoxError) -> Self {
        MempoolError::Store(e)
    }
}

/// Verifies a transaction against the committed and pending state and
/// admits it to the pool.
pub fn add_pending_transaction(
    store: &dyn Store,
    mut tx: RegularTransaction,
) -> Result<(), MempoolError> {
    let hash = tx.hash();
    if store.get_pending_transaction(&hash)?.is_some() || store.get_transaction(&hash)?.is_some() {
        return Err(MempoolError::AlreadyPresent);
    }

    let related_hashes: Vec<transaction::Hash> =
        tx.inputs.iter().map(|input| input.tx_hash).collect();
    let related = store.get_transactions(&related_hashes)?;
    tx.fill_inputs(&related)?;
    tx.distribute_signatures()?;

    let spent = OutputRef::spent_by(&tx);
    if store.get_unspent_outputs(&spent)?.len() != spent.len() {
        return Err(MempoolError::DoubleSpend);
    }
    if !store.get_pending_spent_outputs(&spent)?.is_empty() {
        return Err(MempoolError::DoubleSpend);
    }

    let fees = tx.verify()?;
    store.insert_pending_transaction(&tx, fees)?;
    debug!(%hash, %fees, "admitted pending transaction");
    Ok(())
}

/// Miner ordering: fee per hex byte descending, then length ascending, then
/// bytes lexicographic.
pub fn ordered(entries: Vec<PendingEntry>) -> Vec<PendingEntry> {
    let mut keyed: Vec<(String, PendingEntry)> = entries
        .into_iter()
        .map(|entry| (entry.transaction.hex(), entry))
        .collect();
    keyed.sort_by(|(a_hex, a), (b_hex, b)| {
        // fee_a / len_a vs fee_b / len_b, cross-multiplied to stay integral
        let a_rate = a.fees.smallest() as u128 * b_hex.len() as u128;
        let b_rate = b.fees.smallest() as u128 * a_hex.len() as u128;
        b_rate
            .cmp(&a_rate)
            .then(a_hex.len().cmp(&b_hex.len()))
            .then(a_hex.cmp(b_hex))
    });
    keyed.into_iter().map(|(_, entry)| entry).collect()
}

/// Greedy prefix fill: the longest prefix of the ordered pool whose
/// cumulative hex size fits in a block.
pub fn select_for_block(entries: &[PendingEntry]) -> Vec<PendingEntry> {
    let mut selected = Vec::new();
    let mut size = 0usize;
    for entry in entries {
        let length = entry.transaction.hex_length();
        if size + length > MAX_BLOCK_SIZE_HEX {
            break;
        }
        size += length;
        selected.push(entry.clone());
    }
    selected
}

/// Removes stale pool entries: transactions already committed, conflicts
/// with an earlier-kept entry, and transactions whose inputs are no longer
/// unspent (dropping the whole pool when nothing is left spendable).
pub fn scrub_pending_pool(store: &dyn Store) -> Result<(), MempoolError> {
    // duplicates already on chain
    for entry in store.get_pending_entries()? {
        let hash = entry.transaction.hash();
        if store.get_transaction(&hash)?.is_some() {
            store.remove_pending_transactions(&[hash])?;
            info!(%hash, "scrubbed pending transaction already committed");
        }
    }

    // conflicts between pool entries: the earlier-kept (better-paying)
    // transaction wins, and removal restarts the pass
    let mut used: Vec<OutputRef>;
    'restart: loop {
        used = Vec::new();
        for entry in ordered(store.get_pending_entries()?) {
            let spent = OutputRef::spent_by(&entry.transaction);
            if spent.iter().any(|output| used.contains(output)) {
                let hash = entry.transaction.hash();
                store.remove_pending_transactions(&[hash])?;
                info!(%hash, "scrubbed pending transaction conflicting with the pool");
                continue 'restart;
            }
            used.extend(spent);
        }
        break;
    }

    // entries whose inputs are gone from the unspent set
    if used.is_empty() {
        return Ok(());
    }
    let unspent: HashSet<OutputRef> = store.get_unspent_outputs(&used)?.into_iter().collect();
    let doomed: Vec<OutputRef> = used
        .iter()
        .filter(|output| !unspent.contains(output))
        .copied()
        .collect();
    if doomed.len() == used.len() {
        store.clear_pending_pool()?;
        info!("scrubbed the whole pending pool, nothing was spendable");
    } else if !doomed.is_empty() {
        let fragments: Vec<String> = doomed.iter().map(OutputRef::hex_fragment).collect();
        for entry in store.get_pending_entries()? {
            let hex = entry.transaction.hex();
            if fragments.iter().any(|fragment| hex.contains(fragment)) {
                let hash = entry.transaction.hash();
                store.remove_pending_transactions(&[hash])?;
                info!(%hash, "scrubbed pending transaction spending a spent output");
            }
        }
    }
    Ok(())
}

/// Rate limiter for scrubbing passes; callers combine it with their own
/// probabilistic trigger.
pub struct ScrubTimer {
    last: Mutex<u32>,
}

impl ScrubTimer {
    pub fn new() -> ScrubTimer {
        ScrubTimer {
            last: Mutex::new(0),
        }
    }

    /// True at most once per cooldown window.
    pub fn due(&self, now: u32) -> bool {
        let mut last = self.last.lock().expect("scrub timer lock is never poisoned");
        if now.saturating_sub(*last) < SCRUB_COOLDOWN_SECS {
            return false;
        }
        *last = now;
        true
    }
}

impl Default for ScrubTimer {
    fn default() -> Self {
        ScrubTimer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SledStore;

    use denaro_chain::amount::Amount;
    use denaro_chain::block::{BlockRecord, Hash as BlockHash};
    use denaro_chain::keys::{address_for_key, Address};
    use denaro_chain::transaction::{
        CoinbaseTransaction, TransactionInput, TransactionOutput,
    };
    use p256::ecdsa::SigningKey;
    use tempdir::TempDir;

    fn test_key(seed: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        SigningKey::from_slice(&bytes).expect("small scalars are valid keys")
    }

    fn test_address(seed: u8) -> Address {
        address_for_key(&test_key(seed))
    }

    fn open_store(dir: &TempDir) -> SledStore {
        SledStore::open(&dir.path().join("state")).expect("sled store opens")
    }

    /// Commits a block whose coinbase funds `miner` with 100 coins and
    /// returns the coinbase hash.
    fn fund(store: &SledStore, id: u32, miner: u8) -> transaction::Hash {
        let mut hash_bytes = [0u8; 32];
        hash_bytes[0] = id as u8;
        let block_hash = BlockHash(hash_bytes);
        let coinbase = CoinbaseTransaction::new(
            block_hash,
            test_address(miner),
            Amount::from_coins(100),
            false,
        );
        let block = BlockRecord {
            id,
            hash: block_hash,
            content: String::new(),
            address: test_address(miner).to_full_hex(),
            random: 0,
            difficulty: "6.0".parse().unwrap(),
            reward: Amount::from_coins(100),
            timestamp: id,
        };
        store.commit_block(&block, &coinbase, &[]).expect("commit succeeds");
        coinbase.hash()
    }

    fn spend(
        source: transaction::Hash,
        owner: u8,
        to: u8,
        coins: &str,
        message: Option<Vec<u8>>,
    ) -> RegularTransaction {
        let mut tx = RegularTransaction {
            version: 3,
            inputs: vec![TransactionInput::new(source, 0)],
            outputs: vec![TransactionOutput::new(
                test_address(to),
                coins.parse().unwrap(),
            )],
            message,
            undistributed_signatures: Vec::new(),
        };
        tx.inputs[0].related_output = Some(TransactionOutput::new(
            test_address(owner),
            Amount::from_coins(100),
        ));
        tx.sign(&test_key(owner));
        // admission refills from the store
        tx.inputs[0].related_output = None;
        tx
    }

    #[test]
    fn admission_checks_the_unspent_set() {
        let dir = TempDir::new("mempool").unwrap();
        let store = open_store(&dir);
        let coinbase = fund(&store, 1, 7);

        add_pending_transaction(&store, spend(coinbase, 7, 8, "99", None)).unwrap();
        assert_eq!(store.get_pending_entries().unwrap().len(), 1);

        // unknown output
        let bogus = spend(transaction::Hash([9u8; 32]), 7, 8, "99", None);
        assert!(matches!(
            add_pending_transaction(&store, bogus),
            Err(MempoolError::Invalid(_))
        ));
    }

    #[test]
    fn conflicting_spend_is_rejected_and_pool_unchanged() {
        let dir = TempDir::new("mempool").unwrap();
        let store = open_store(&dir);
        let coinbase = fund(&store, 1, 7);

        let first = spend(coinbase, 7, 8, "99", None);
        let first_hash = first.hash();
        add_pending_transaction(&store, first).unwrap();

        let conflicting = spend(coinbase, 7, 9, "98", None);
        assert!(matches!(
            add_pending_transaction(&store, conflicting),
            Err(MempoolError::DoubleSpend)
        ));

        let entries = store.get_pending_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction.hash(), first_hash);
    }

    #[test]
    fn resubmission_reports_already_present() {
        let dir = TempDir::new("mempool").unwrap();
        let store = open_store(&dir);
        let coinbase = fund(&store, 1, 7);

        add_pending_transaction(&store, spend(coinbase, 7, 8, "99", None)).unwrap();
        assert!(matches!(
            add_pending_transaction(&store, spend(coinbase, 7, 8, "99", None)),
            Err(MempoolError::AlreadyPresent)
        ));
    }

    #[test]
    fn ordering_prefers_fee_per_byte() {
        let dir = TempDir::new("mempool").unwrap();
        let store = open_store(&dir);
        let c1 = fund(&store, 1, 7);
        let c2 = fund(&store, 2, 9);

        // the longer transaction pays a disproportionately higher fee
        let small = spend(c1, 7, 8, "99.99", Some(vec![0x61; 300]));
        let large = spend(c2, 9, 8, "99.97", Some(vec![0x61; 800]));
        add_pending_transaction(&store, small.clone()).unwrap();
        add_pending_transaction(&store, large.clone()).unwrap();

        let entries = ordered(store.get_pending_entries().unwrap());
        let small_rate = 10_000f64 / small.hex_length() as f64;
        let large_rate = 30_000f64 / large.hex_length() as f64;
        assert!(large_rate > small_rate);
        assert_eq!(entries[0].transaction.hash(), large.hash());
        assert_eq!(entries[1].transaction.hash(), small.hash());
    }

    #[test]
    fn greedy_fill_respects_the_block_size() {
        assert!(select_for_block(&[]).is_empty());

        // transactions carrying the largest possible message: 31 of them
        // fit in a block, the 32nd would cross the limit
        let huge = RegularTransaction {
            version: 3,
            inputs: Vec::new(),
            outputs: Vec::new(),
            message: Some(vec![0x61; 65_535]),
            undistributed_signatures: Vec::new(),
        };
        let entries: Vec<PendingEntry> = (0..33)
            .map(|_| PendingEntry {
                transaction: huge.clone(),
                fees: Amount::from_smallest(1),
            })
            .collect();

        let selected = select_for_block(&entries);
        let total: usize = selected
            .iter()
            .map(|entry| entry.transaction.hex_length())
            .sum();
        assert!(total <= denaro_chain::block::MAX_BLOCK_SIZE_HEX);
        assert!(selected.len() < entries.len());
        assert_eq!(
            denaro_chain::block::MAX_BLOCK_SIZE_HEX / huge.hex_length(),
            selected.len()
        );
    }

    #[test]
    fn scrub_removes_spent_entries() {
        let dir = TempDir::new("mempool").unwrap();
        let store = open_store(&dir);
        let c1 = fund(&store, 1, 7);
        let c2 = fund(&store, 2, 9);

        add_pending_transaction(&store, spend(c1, 7, 8, "99", None)).unwrap();
        add_pending_transaction(&store, spend(c2, 9, 8, "99", None)).unwrap();

        // rolling back block 2 takes the second coinbase output with it
        store.delete_blocks_above(1).unwrap();
        assert!(store
            .get_unspent_outputs(&[OutputRef::new(c2, 0)])
            .unwrap()
            .is_empty());

        scrub_pending_pool(&store).unwrap();
        let entries = store.get_pending_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            OutputRef::spent_by(&entries[0].transaction),
            vec![OutputRef::new(c1, 0)]
        );
    }

    #[test]
    fn scrub_timer_enforces_the_cooldown() {
        let timer = ScrubTimer::new();
        assert!(timer.due(1_000));
        assert!(!timer.due(1_000 + SCRUB_COOLDOWN_SECS - 1));
        assert!(timer.due(1_000 + SCRUB_COOLDOWN_SECS));
    }
}
