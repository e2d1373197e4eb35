//! Difficulty retargeting.
//!
//! Every [`BLOCKS_COUNT`] blocks the node measures how fast the last window
//! was mined, converts the current difficulty to an implied hashrate,
//! scales it by the ratio to the target spacing, and converts back,
//! truncating to one decimal. Two conversion formulas exist: the original
//! one and a corrected one, switching eras at height
//! [`HASHRATE_FORMULA_HEIGHT`](denaro_chain::parameters::HASHRATE_FORMULA_HEIGHT).
//! The era tests are deliberately asymmetric (`<=` forward, `<` backward),
//! exactly like the chain history demands.

use denaro_chain::block::{BlockRecord, Difficulty};
use denaro_chain::parameters::HASHRATE_FORMULA_HEIGHT;
use denaro_state::{BoxError, Store};

/// Target seconds between blocks.
pub const BLOCK_TIME: u32 = 180;

/// Width of the retarget window in blocks.
pub const BLOCKS_COUNT: u32 = 500;

/// Difficulty of the first retarget window.
pub const START_DIFFICULTY: Difficulty = Difficulty::from_tenths(60);

/// How many of the 16 hex characters remain allowed at the fractional
/// position: `ceil(16 * (1 - decimal))`.
pub fn allowed_charset_len(fractional_tenths: u8) -> usize {
    (16 * (10 - fractional_tenths as usize) + 9) / 10
}

/// Original hashrate implied by a difficulty. A zero fractional digit is
/// read as 1/16.
pub fn difficulty_to_hashrate_old(difficulty: Difficulty) -> f64 {
    let decimal = match difficulty.fractional_tenths() {
        0 => 1.0 / 16.0,
        f => f as f64 / 10.0,
    };
    16f64.powi(difficulty.integer() as i32) * (16.0 * decimal)
}

/// Corrected hashrate implied by a difficulty, derived from the real size
/// of the allowed character set.
pub fn difficulty_to_hashrate(difficulty: Difficulty) -> f64 {
    let count = allowed_charset_len(difficulty.fractional_tenths());
    16f64.powi(difficulty.integer() as i32) * (16.0 / count as f64)
}

/// Original difficulty for a hashrate.
pub fn hashrate_to_difficulty_old(hashrate: f64) -> f64 {
    let difficulty = hashrate.log(16.0).trunc();
    if hashrate == 16f64.powf(difficulty) {
        return difficulty;
    }
    difficulty + (hashrate / 16f64.powf(difficulty)) / 16.0
}

/// Corrected difficulty for a hashrate.
pub fn hashrate_to_difficulty(hashrate: f64) -> f64 {
    let difficulty = hashrate.log(16.0).trunc();
    if hashrate == 16f64.powf(difficulty) {
        return difficulty;
    }
    let ratio = hashrate / 16f64.powf(difficulty);
    let decimal = 16.0 / ratio / 16.0;
    let decimal = 1.0 - (decimal * 10.0).floor() / 10.0;
    difficulty + decimal
}

fn truncate_to_tenths(difficulty: f64) -> Difficulty {
    Difficulty::from_tenths((difficulty * 10.0).floor() as u16)
}

/// The difficulty the next block must meet, plus the block it extends.
///
/// Outside a retarget boundary this is the last block's difficulty; on a
/// boundary it is recomputed from the elapsed time of the closing window.
pub fn calculate_difficulty(
    store: &dyn Store,
) -> Result<(Difficulty, Option<BlockRecord>), BoxError> {
    let last_block = match store.get_last_block()? {
        Some(block) => block,
        None => return Ok((START_DIFFICULTY, None)),
    };
    if last_block.id < BLOCKS_COUNT {
        return Ok((START_DIFFICULTY, Some(last_block)));
    }

    if last_block.id % BLOCKS_COUNT == 0 {
        let last_adjust_block = store
            .get_block_by_id(last_block.id - BLOCKS_COUNT + 1)?
            .ok_or("retarget window start block is missing")?;
        let elapsed = last_block.timestamp - last_adjust_block.timestamp;
        let average_per_block = elapsed as f64 / BLOCKS_COUNT as f64;

        let last_difficulty = last_block.difficulty;
        let mut hashrate = if last_block.id <= HASHRATE_FORMULA_HEIGHT {
            difficulty_to_hashrate_old(last_difficulty)
        } else {
            difficulty_to_hashrate(last_difficulty)
        };
        hashrate *= BLOCK_TIME as f64 / average_per_block;

        let new_difficulty = if last_block.id < HASHRATE_FORMULA_HEIGHT {
            hashrate_to_difficulty_old(hashrate)
        } else {
            hashrate_to_difficulty(hashrate)
        };
        return Ok((truncate_to_tenths(new_difficulty), Some(last_block)));
    }

    Ok((last_block.difficulty, Some(last_block)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn difficulty(s: &str) -> Difficulty {
        s.parse().unwrap()
    }

    #[test]
    fn charset_len_narrows_with_the_fraction() {
        assert_eq!(allowed_charset_len(0), 16);
        assert_eq!(allowed_charset_len(5), 8);
        assert_eq!(allowed_charset_len(9), 2);
    }

    #[test]
    fn hashrate_conversions_round_trip_at_whole_difficulties() {
        assert_eq!(difficulty_to_hashrate(difficulty("6.0")), 16f64.powi(6));
        assert_eq!(hashrate_to_difficulty(16f64.powi(6)), 6.0);
        assert_eq!(hashrate_to_difficulty_old(16f64.powi(6)), 6.0);
    }

    #[test]
    fn fractional_difficulties_imply_a_narrower_search() {
        // 6.5 leaves 8 of 16 characters: twice the work of 6.0
        assert_eq!(
            difficulty_to_hashrate(difficulty("6.5")),
            2.0 * 16f64.powi(6)
        );
        assert_eq!(hashrate_to_difficulty(2.0 * 16f64.powi(6)), 6.5);
    }

    #[test]
    fn old_formula_reads_a_whole_difficulty_as_a_sixteenth() {
        assert_eq!(difficulty_to_hashrate_old(difficulty("6.0")), 16f64.powi(6));
        assert_eq!(
            difficulty_to_hashrate_old(difficulty("6.5")),
            8.0 * 16f64.powi(6)
        );
    }

    #[test]
    fn retarget_raises_difficulty_after_a_fast_window() {
        use denaro_chain::amount::Amount;
        use denaro_chain::block::{self, BlockRecord};
        use denaro_chain::keys::address_for_key;
        use denaro_chain::transaction::CoinbaseTransaction;
        use denaro_state::SledStore;
        use p256::ecdsa::SigningKey;
        use tempdir::TempDir;

        let dir = TempDir::new("difficulty").unwrap();
        let store = SledStore::open(&dir.path().join("state")).unwrap();
        let mut key_bytes = [0u8; 32];
        key_bytes[31] = 3;
        let address = address_for_key(&SigningKey::from_slice(&key_bytes).unwrap());

        // a full retarget window mined twice as fast as the 180 s target
        for id in 1..=BLOCKS_COUNT {
            let mut hash_bytes = [0u8; 32];
            hash_bytes[..4].copy_from_slice(&id.to_le_bytes());
            let hash = block::Hash(hash_bytes);
            let block = BlockRecord {
                id,
                hash,
                content: String::new(),
                address: address.to_full_hex(),
                random: 0,
                difficulty: START_DIFFICULTY,
                reward: Amount::from_coins(100),
                timestamp: id * 90,
            };
            let coinbase =
                CoinbaseTransaction::new(hash, address, Amount::from_coins(100), false);
            store.commit_block(&block, &coinbase, &[]).unwrap();
        }

        let (new_difficulty, last) = calculate_difficulty(&store).unwrap();
        assert_eq!(last.unwrap().id, BLOCKS_COUNT);
        assert_eq!(new_difficulty, difficulty("6.1"));
    }

    #[test]
    fn difficulty_holds_before_the_first_window_closes() {
        use denaro_state::SledStore;
        use tempdir::TempDir;

        let dir = TempDir::new("difficulty").unwrap();
        let store = SledStore::open(&dir.path().join("state")).unwrap();
        let (difficulty, last) = calculate_difficulty(&store).unwrap();
        assert_eq!(difficulty, START_DIFFICULTY);
        assert!(last.is_none());
    }
}
