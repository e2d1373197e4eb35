use byteorder::{LittleEndian, ReadBytesExt};
use std::io;

use super::SerializationError;

type Result<R> = std::result::Result<R, SerializationError>;

pub trait DenaroDeserialize {
    fn denaro_deserialize<R: io::Read>(reader: R) -> Result<Self>
    where
        Self: Sized;
}

/// Helper for deserializing more succinctly via type inference
pub trait DenaroDeserializeInto {
    /// Deserialize based on type inference
    fn denaro_deserialize_into<T>(self) -> Result<T>
    where
        T: DenaroDeserialize;
}

impl<R: io::Read> DenaroDeserializeInto for R {
    fn denaro_deserialize_into<T>(self) -> Result<T>
    where
        T: DenaroDeserialize,
    {
        T::denaro_deserialize(self)
    }
}

impl DenaroDeserialize for u8 {
    fn denaro_deserialize<R: io::Read>(mut reader: R) -> Result<u8> {
        Ok(reader.read_u8()?)
    }
}

impl DenaroDeserialize for u16 {
    fn denaro_deserialize<R: io::Read>(mut reader: R) -> Result<u16> {
        Ok(reader.read_u16::<LittleEndian>()?)
    }
}

impl DenaroDeserialize for u32 {
    fn denaro_deserialize<R: io::Read>(mut reader: R) -> Result<u32> {
        Ok(reader.read_u32::<LittleEndian>()?)
    }
}

impl DenaroDeserialize for u64 {
    fn denaro_deserialize<R: io::Read>(mut reader: R) -> Result<u64> {
        Ok(reader.read_u64::<LittleEndian>()?)
    }
}

impl DenaroDeserialize for [u8; 32] {
    fn denaro_deserialize<R: io::Read>(mut reader: R) -> Result<[u8; 32]> {
        let mut result = [0u8; 32];
        reader.read_exact(&mut result)?;
        Ok(result)
    }
}
