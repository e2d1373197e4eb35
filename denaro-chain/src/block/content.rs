//! The block header content codec.
//!
//! The content is the exact byte string miners hash:
//!
//! ```text
//! [version:1 if compressed] previous_hash:32 address:(64|33)
//! merkle_root:32 timestamp:4 difficulty_x10:2 nonce:4
//! ```
//!
//! A 64-byte (full) miner address means version 1 and no version byte, for
//! a total of 138 bytes; a 33-byte (compressed) address is preceded by a
//! version byte of 2, for a total of 108 bytes.

use std::io::Cursor;

use crate::block::{merkle, Difficulty, Hash};
use crate::keys::{self, Address};
use crate::serialization::{DenaroDeserialize, DenaroSerialize, SerializationError};

/// Byte length of a version 1 header.
const FULL_ADDRESS_CONTENT_LEN: usize = 138;
/// Byte length of a version 2 header.
const COMPRESSED_ADDRESS_CONTENT_LEN: usize = 108;

/// The parsed fields of a block header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockContent {
    pub previous_hash: Hash,
    /// Raw miner address: 64 bytes full or 33 bytes compressed.
    pub address_bytes: Vec<u8>,
    pub merkle_root: merkle::Root,
    pub timestamp: u32,
    pub difficulty: Difficulty,
    pub nonce: u32,
}

impl BlockContent {
    /// Splits a hex-encoded header into its fields.
    pub fn from_hex(content_hex: &str) -> Result<BlockContent, SerializationError> {
        let bytes = hex::decode(content_hex)
            .map_err(|_| SerializationError::Parse("block content is not valid hex"))?;
        let mut reader = Cursor::new(&bytes[..]);

        let address_len = if bytes.len() == FULL_ADDRESS_CONTENT_LEN {
            64
        } else {
            let version = u8::denaro_deserialize(&mut reader)?;
            if version != 2 {
                return Err(SerializationError::Parse("unsupported block version"));
            }
            if bytes.len() != COMPRESSED_ADDRESS_CONTENT_LEN {
                return Err(SerializationError::Parse("invalid block content length"));
            }
            33
        };

        let previous_hash = Hash(<[u8; 32]>::denaro_deserialize(&mut reader)?);
        let mut address_bytes = vec![0u8; address_len];
        std::io::Read::read_exact(&mut reader, &mut address_bytes)?;
        let merkle_root = merkle::Root(<[u8; 32]>::denaro_deserialize(&mut reader)?);
        let timestamp = u32::denaro_deserialize(&mut reader)?;
        let difficulty = Difficulty::from_tenths(u16::denaro_deserialize(&mut reader)?);
        let nonce = u32::denaro_deserialize(&mut reader)?;

        Ok(BlockContent {
            previous_hash,
            address_bytes,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
        })
    }

    /// Rebuilds the exact header bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FULL_ADDRESS_CONTENT_LEN);
        if self.is_compressed() {
            bytes.push(2);
        }
        bytes.extend_from_slice(&self.previous_hash.0);
        bytes.extend_from_slice(&self.address_bytes);
        bytes.extend_from_slice(&self.merkle_root.0);
        self.timestamp
            .denaro_serialize(&mut bytes)
            .expect("writing to a Vec cannot fail");
        self.difficulty
            .tenths()
            .denaro_serialize(&mut bytes)
            .expect("writing to a Vec cannot fail");
        self.nonce
            .denaro_serialize(&mut bytes)
            .expect("writing to a Vec cannot fail");
        bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// SHA-256 over the header bytes: the block hash miners grind.
    pub fn hash(&self) -> Hash {
        Hash(crate::sha256(&self.to_bytes()))
    }

    pub fn is_compressed(&self) -> bool {
        self.address_bytes.len() == 33
    }

    /// The miner address string as the store records it: hex for full
    /// encodings, base58 for compressed ones.
    pub fn address_string(&self) -> String {
        keys::address_bytes_to_string(&self.address_bytes)
            .expect("address length was validated at parse time")
    }

    /// The miner address as a validated curve point.
    pub fn address(&self) -> Result<Address, SerializationError> {
        Address::from_point_bytes(&self.address_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::address_for_key;
    use p256::ecdsa::SigningKey;

    fn content_with_address(address_bytes: Vec<u8>) -> BlockContent {
        BlockContent {
            previous_hash: crate::block::genesis_previous_hash(),
            address_bytes,
            merkle_root: merkle::root_ordered(&[]),
            timestamp: 1_638_463_765,
            difficulty: "6.0".parse().unwrap(),
            nonce: 0xdeadbeef,
        }
    }

    fn test_address() -> crate::keys::Address {
        let mut bytes = [0u8; 32];
        bytes[31] = 5;
        address_for_key(&SigningKey::from_slice(&bytes).unwrap())
    }

    #[test]
    fn full_address_header_is_138_bytes_and_round_trips() {
        let content = content_with_address(test_address().to_full_bytes().to_vec());
        let bytes = content.to_bytes();
        assert_eq!(bytes.len(), 138);

        let parsed = BlockContent::from_hex(&content.to_hex()).unwrap();
        assert_eq!(parsed, content);
        assert!(!parsed.is_compressed());
    }

    #[test]
    fn compressed_address_header_is_108_bytes_with_version_byte() {
        let content = content_with_address(test_address().to_compressed_bytes().to_vec());
        let bytes = content.to_bytes();
        assert_eq!(bytes.len(), 108);
        assert_eq!(bytes[0], 2);

        let parsed = BlockContent::from_hex(&content.to_hex()).unwrap();
        assert_eq!(parsed, content);
        assert!(parsed.is_compressed());
        assert_eq!(parsed.address().unwrap(), test_address());
    }

    #[test]
    fn junk_lengths_are_rejected()  {
        assert!(BlockContent::from_hex("ab").is_err());
        assert!(BlockContent::from_hex("zz").is_err());
        // 108 bytes whose version byte is not 2
        let bytes = vec![7u8; COMPRESSED_ADDRESS_CONTENT_LEN];
        assert!(BlockContent::from_hex(&hex::encode(bytes)).is_err());
    }
}
