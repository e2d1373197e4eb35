//! Consensus-critical serialization.
//!
//! This module contains two traits: `DenaroSerialize` and `DenaroDeserialize`,
//! analogs of the Serde `Serialize` and `Deserialize` traits but intended for
//! the consensus-critical wire format. Every multi-byte integer field in the
//! format is little-endian.

mod deserialize;
mod error;

pub use deserialize::{DenaroDeserialize, DenaroDeserializeInto};
pub use error::SerializationError;

use byteorder::{LittleEndian, WriteBytesExt};

pub trait DenaroSerialize {
    fn denaro_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error>;

    fn denaro_serialize_to_vec(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut data = Vec::new();
        self.denaro_serialize(&mut data)?;
        Ok(data)
    }

    /// The hex rendering of the serialized bytes, which is the form the
    /// original network exchanges and hashes.
    fn denaro_serialize_to_hex(&self) -> Result<String, std::io::Error> {
        Ok(hex::encode(self.denaro_serialize_to_vec()?))
    }
}

impl DenaroSerialize for u8 {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_all(&[*self])
    }
}

impl DenaroSerialize for u16 {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u16::<LittleEndian>(*self)
    }
}

impl DenaroSerialize for u32 {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u32::<LittleEndian>(*self)
    }
}

impl DenaroSerialize for u64 {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u64::<LittleEndian>(*self)
    }
}

impl DenaroSerialize for &[u8] {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}

impl DenaroSerialize for [u8; 32] {
    fn denaro_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}
