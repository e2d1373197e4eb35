//! Blocks and block-related structures (hashes, header content, merkle
//! roots, difficulty).

mod content;
mod difficulty;
mod hash;

pub mod merkle;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

pub use content::BlockContent;
pub use difficulty::Difficulty;
pub use hash::{hash_content, Hash};

/// Upper bound on the serialized transactions of one block, counted in hex
/// characters (4 MB of hex, 2 MB of raw bytes).
pub const MAX_BLOCK_SIZE_HEX: usize = 4096 * 1024;

/// The previous-hash value mined against by the first block: the network
/// birthday 30_06_2005 as a 32-byte little-endian integer.
pub fn genesis_previous_hash() -> Hash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&30_06_2005u64.to_le_bytes());
    Hash(bytes)
}

/// A committed block as the store keeps it: the parsed header fields plus
/// the exact content hex the proof of work was computed over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Position in the chain, starting at 1.
    pub id: u32,
    pub hash: Hash,
    /// The exact header bytes, hex-encoded; `hash` = SHA-256 of them.
    pub content: String,
    /// Miner address, in the string form matching its header encoding.
    pub address: String,
    /// The 4-byte nonce.
    pub random: u32,
    pub difficulty: Difficulty,
    /// Block reward plus collected fees.
    pub reward: Amount,
    pub timestamp: u32,
}
