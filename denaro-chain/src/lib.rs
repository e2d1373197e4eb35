//! Core chain types shared by all node components: amounts, addresses,
//! transactions, blocks, and the consensus-critical wire codec.
#![allow(clippy::unit_arg)]

pub mod amount;
pub mod block;
pub mod keys;
pub mod parameters;
pub mod serialization;
pub mod transaction;

pub use serialization::{DenaroDeserialize, DenaroDeserializeInto, DenaroSerialize};
pub use serialization::SerializationError;

/// Hash a byte slice with a single round of SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The current UTC time as a unix timestamp, truncated to seconds.
///
/// Block header timestamps are 4-byte unsigned seconds, so this is the
/// clock every consensus check compares against.
pub fn timestamp() -> u32 {
    chrono::Utc::now().timestamp() as u32
}
