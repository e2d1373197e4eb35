//! The transaction merkle root.
//!
//! There is no tree layering in this system: the root is a single SHA-256
//! over the concatenation of each transaction's SHA-256 digest. Blocks up
//! to height 22499 hash the transactions in miner-chosen order; later
//! blocks pre-sort them by their serialized bytes.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::serialization::SerializationError;

/// The merkle root committed in a block header.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Root(pub [u8; 32]);

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("merkle::Root")
            .field(&hex::encode(self.0))
            .finish()
    }
}

impl std::str::FromStr for Root {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(SerializationError::Parse("hex decoding error"))
        } else {
            Ok(Root(bytes))
        }
    }
}

/// Root over transactions in the order given (legacy mode, heights
/// below 22500).
pub fn root_ordered(transactions: &[Vec<u8>]) -> Root {
    let mut concatenated = Sha256::new();
    for transaction in transactions {
        concatenated.update(crate::sha256(transaction));
    }
    Root(concatenated.finalize().into())
}

/// Root over transactions sorted by their serialized bytes.
pub fn root_sorted(transactions: &[Vec<u8>]) -> Root {
    let mut sorted: Vec<&Vec<u8>> = transactions.iter().collect();
    sorted.sort();
    let mut concatenated = Sha256::new();
    for transaction in sorted {
        concatenated.update(crate::sha256(transaction));
    }
    Root(concatenated.finalize().into())
}

/// Root recomputed from per-transaction digests, the form miners work with
/// when they only know pending transaction hashes.
pub fn root_from_hashes(hashes: &[crate::transaction::Hash]) -> Root {
    let mut concatenated = Sha256::new();
    for hash in hashes {
        concatenated.update(hash.as_bytes());
    }
    Root(concatenated.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_mode_ignores_miner_order() {
        let a = vec![3u8, 1, 2];
        let b = vec![1u8, 2, 3];
        assert_eq!(
            root_sorted(&[a.clone(), b.clone()]),
            root_sorted(&[b.clone(), a.clone()])
        );
        assert_ne!(
            root_ordered(&[a.clone(), b.clone()]),
            root_ordered(&[b, a])
        );
    }

    #[test]
    fn hash_form_matches_ordered_form() {
        let txs = vec![vec![1u8, 2], vec![3u8, 4]];
        let hashes: Vec<_> = txs
            .iter()
            .map(|tx| crate::transaction::Hash::of_bytes(tx))
            .collect();
        assert_eq!(root_ordered(&txs), root_from_hashes(&hashes));
    }
}
