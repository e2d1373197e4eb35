//! Stateless consensus check functions.
//!
//! Each rule is a standalone function returning `Ok(())` or a typed
//! [`BlockError`], so the pipeline stays a readable sequence and every rule
//! is testable on its own.

use denaro_chain::block::{self, merkle, BlockContent, BlockRecord, Difficulty, MAX_BLOCK_SIZE_HEX};
use denaro_chain::parameters::{checkpoint, SORTED_MERKLE_HEIGHT};
use denaro_chain::transaction::RegularTransaction;
use denaro_chain::DenaroSerialize;

use crate::difficulty::allowed_charset_len;
use crate::error::BlockError;

const CHARSET: &str = "0123456789abcdef";

/// The fractional leading-hex proof-of-work rule.
///
/// A hash passes when its first `floor(difficulty)` hex chars equal the
/// last `floor(difficulty)` chars of the previous block hash, and, for a
/// fractional difficulty, its next char falls in the first
/// `ceil(16·(1−fraction))` chars of the hex alphabet. The first block of
/// the chain has nothing to chain onto and always passes.
pub fn proof_of_work(
    block_hash: &block::Hash,
    difficulty: Difficulty,
    previous_hash: Option<&block::Hash>,
) -> Result<(), BlockError> {
    let previous_hash = match previous_hash {
        Some(hash) => hash,
        None => return Ok(()),
    };
    let hash_hex = block_hash.to_string();
    let previous_hex = previous_hash.to_string();

    let chained = difficulty.integer();
    let chunk = &previous_hex[previous_hex.len() - chained..];
    if !hash_hex.starts_with(chunk) {
        return Err(BlockError::InvalidProofOfWork);
    }

    let fraction = difficulty.fractional_tenths();
    if fraction > 0 {
        let allowed = &CHARSET[..allowed_charset_len(fraction)];
        let next = hash_hex.as_bytes()[chained] as char;
        if !allowed.contains(next) {
            return Err(BlockError::InvalidProofOfWork);
        }
    }
    Ok(())
}

/// Header timestamps must move strictly forward and never into the future.
pub fn timestamp_is_valid(
    content_time: u32,
    last_block: Option<&BlockRecord>,
    now: u32,
) -> Result<(), BlockError> {
    if let Some(last_block) = last_block {
        if content_time <= last_block.timestamp {
            return Err(BlockError::TimestampNotMonotonic);
        }
    }
    if content_time > now {
        return Err(BlockError::TimestampInFuture);
    }
    Ok(())
}

/// The serialized transactions of a block must fit in
/// [`MAX_BLOCK_SIZE_HEX`] hex chars.
pub fn transactions_size(transactions: &[RegularTransaction]) -> Result<(), BlockError> {
    let total: usize = transactions.iter().map(|tx| tx.hex_length()).sum();
    if total > MAX_BLOCK_SIZE_HEX {
        return Err(BlockError::OversizedBlock);
    }
    Ok(())
}

/// Recomputes the merkle root in the mode of the block's height and
/// compares it to the header, with the checkpoint block's documented
/// fallback root as the one exception.
pub fn merkle_root_is_valid(
    block_no: u32,
    transactions: &[RegularTransaction],
    expected: &merkle::Root,
) -> Result<(), BlockError> {
    let serialized: Result<Vec<Vec<u8>>, _> = transactions
        .iter()
        .map(|tx| tx.denaro_serialize_to_vec())
        .collect();
    let serialized = serialized.map_err(denaro_chain::SerializationError::from)?;

    let computed = if block_no >= SORTED_MERKLE_HEIGHT {
        merkle::root_sorted(&serialized)
    } else {
        merkle::root_ordered(&serialized)
    };
    if computed == *expected {
        return Ok(());
    }

    if block_no == checkpoint::HEIGHT {
        let fallback: merkle::Root = checkpoint::FALLBACK_MERKLE_ROOT
            .parse()
            .expect("checkpoint root constant is valid hex");
        if merkle::root_sorted(&serialized) == fallback {
            return Ok(());
        }
    }
    Err(BlockError::BadMerkleRoot)
}

/// The checkpoint block is matched field-by-field instead of by proof of
/// work.
pub fn checkpoint_fields_match(content: &BlockContent) -> Result<(), BlockError> {
    if content.address_string() != checkpoint::ADDRESS
        || content.timestamp != checkpoint::TIMESTAMP
        || content.nonce != checkpoint::NONCE
    {
        return Err(BlockError::CheckpointMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(hex_str: &str) -> block::Hash {
        hex_str.parse().unwrap()
    }

    fn difficulty(s: &str) -> Difficulty {
        s.parse().unwrap()
    }

    // a previous hash ending in "abcdef", and candidate hashes chained on it
    const PREVIOUS: &str = "00000000000000000000000000000000000000000000000000000000ffabcdef";
    const CHAINED_LOW: &str =
        "abcdef0000000000000000000000000000000000000000000000000000000000";
    const CHAINED_HIGH: &str =
        "abcdef8000000000000000000000000000000000000000000000000000000000";
    const UNCHAINED: &str =
        "abcdee0000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn integer_difficulty_chains_six_chars() {
        let previous = hash(PREVIOUS);
        assert!(proof_of_work(&hash(CHAINED_LOW), difficulty("6.0"), Some(&previous)).is_ok());
        assert!(proof_of_work(&hash(CHAINED_HIGH), difficulty("6.0"), Some(&previous)).is_ok());
        assert!(proof_of_work(&hash(UNCHAINED), difficulty("6.0"), Some(&previous)).is_err());
    }

    #[test]
    fn fractional_difficulty_narrows_the_seventh_char() {
        let previous = hash(PREVIOUS);
        // 6.5 allows "01234567" at position 6
        assert!(proof_of_work(&hash(CHAINED_LOW), difficulty("6.5"), Some(&previous)).is_ok());
        assert!(proof_of_work(&hash(CHAINED_HIGH), difficulty("6.5"), Some(&previous)).is_err());
        // 6.9 allows only "01"
        assert!(proof_of_work(&hash(CHAINED_LOW), difficulty("6.9"), Some(&previous)).is_ok());
    }

    #[test]
    fn the_first_block_has_no_work_to_prove() {
        assert!(proof_of_work(&hash(UNCHAINED), difficulty("6.0"), None).is_ok());
    }

    #[test]
    fn timestamps_move_strictly_forward() {
        let mut last = BlockRecord {
            id: 1,
            hash: hash(PREVIOUS),
            content: String::new(),
            address: String::new(),
            random: 0,
            difficulty: difficulty("6.0"),
            reward: denaro_chain::amount::Amount::ZERO,
            timestamp: 100,
        };
        assert!(timestamp_is_valid(101, Some(&last), 200).is_ok());
        assert!(matches!(
            timestamp_is_valid(100, Some(&last), 200),
            Err(BlockError::TimestampNotMonotonic)
        ));
        assert!(matches!(
            timestamp_is_valid(300, Some(&last), 200),
            Err(BlockError::TimestampInFuture)
        ));
        last.timestamp = 0;
        assert!(timestamp_is_valid(1, Some(&last), 200).is_ok());
        assert!(timestamp_is_valid(50, None, 200).is_ok());
    }

    #[test]
    fn merkle_mode_switches_at_the_activation_height() {
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
        let txs = [tx_b.clone(), tx_a.clone()];
        let bytes: Vec<Vec<u8>> = txs
            .iter()
            .map(|tx| tx.denaro_serialize_to_vec().unwrap())
            .collect();

        let ordered = merkle::root_ordered(&bytes);
        let sorted = merkle::root_sorted(&bytes);
        assert_ne!(ordered, sorted);

        assert!(merkle_root_is_valid(100, &txs, &ordered).is_ok());
        assert!(merkle_root_is_valid(100, &txs, &sorted).is_err());
        assert!(merkle_root_is_valid(SORTED_MERKLE_HEIGHT, &txs, &sorted).is_ok());
        assert!(merkle_root_is_valid(SORTED_MERKLE_HEIGHT, &txs, &ordered).is_err());
    }
}
