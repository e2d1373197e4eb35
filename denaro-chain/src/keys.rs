//! Addresses, public-key points, and ECDSA signatures.
//!
//! An address is a point on the NIST P-256 curve. Two string encodings
//! coexist on the network:
//!
//! - *full hex*: `x:32 ‖ y:32`, both little-endian, rendered as 128 hex
//!   chars (version 1 transactions and 138-byte block headers);
//! - *compressed*: a parity byte (42 = even y, 43 = odd y) followed by the
//!   32-byte little-endian x coordinate, base58-encoded without a checksum
//!   (version 3 transactions and 108-byte block headers).
//!
//! Addresses are equal when their points are equal, never by comparing
//! encoded strings.

use std::fmt;
use std::str::FromStr;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey};

use crate::serialization::SerializationError;

/// Parity marker for a compressed point with an even y coordinate.
pub const EVEN_PARITY: u8 = 42;
/// Parity marker for a compressed point with an odd y coordinate.
pub const ODD_PARITY: u8 = 43;

/// A P-256 point identifying the owner of transaction outputs.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Address(PublicKey);

impl Address {
    /// The 64-byte full encoding: `x ‖ y`, little-endian.
    pub fn to_full_bytes(&self) -> [u8; 64] {
        let point = self.0.to_encoded_point(false);
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(point.x().expect("non-identity point has x"));
        bytes[32..].copy_from_slice(point.y().expect("uncompressed point has y"));
        bytes[..32].reverse();
        bytes[32..].reverse();
        bytes
    }

    /// The 33-byte compressed encoding: parity byte then little-endian x.
    pub fn to_compressed_bytes(&self) -> [u8; 33] {
        let point = self.0.to_encoded_point(false);
        let y = point.y().expect("uncompressed point has y");
        let mut bytes = [0u8; 33];
        bytes[0] = if y[31] & 1 == 0 { EVEN_PARITY } else { ODD_PARITY };
        bytes[1..].copy_from_slice(point.x().expect("non-identity point has x"));
        bytes[1..].reverse();
        bytes
    }

    pub fn to_full_hex(&self) -> String {
        hex::encode(self.to_full_bytes())
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_compressed_bytes()).into_string()
    }

    /// Rebuilds the point from a 64-byte `x ‖ y` little-endian encoding,
    /// rejecting anything that is not on the curve.
    pub fn from_full_bytes(bytes: &[u8; 64]) -> Result<Address, SerializationError> {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[..32]);
        y.copy_from_slice(&bytes[32..]);
        x.reverse();
        y.reverse();
        let point =
            EncodedPoint::from_affine_coordinates(&FieldBytes::from(x), &FieldBytes::from(y), false);
        Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .map(Address)
            .ok_or(SerializationError::Parse("point is not on the curve"))
    }

    /// Recovers the full point from a compressed encoding by solving
    /// `y² = x³ + ax + b` and picking the root selected by the parity byte.
    pub fn from_compressed_bytes(bytes: &[u8; 33]) -> Result<Address, SerializationError> {
        let tag = match bytes[0] {
            EVEN_PARITY => 0x02,
            ODD_PARITY => 0x03,
            _ => return Err(SerializationError::Parse("invalid parity byte")),
        };
        let mut sec1 = [0u8; 33];
        sec1[0] = tag;
        sec1[1..].copy_from_slice(&bytes[1..]);
        sec1[1..].reverse();
        let point = EncodedPoint::from_bytes(sec1)
            .map_err(|_| SerializationError::Parse("malformed compressed point"))?;
        Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .map(Address)
            .ok_or(SerializationError::Parse("point is not on the curve"))
    }

    /// Parses either encoding based on the byte length.
    pub fn from_point_bytes(bytes: &[u8]) -> Result<Address, SerializationError> {
        match bytes.len() {
            64 => Address::from_full_bytes(bytes.try_into().expect("length checked")),
            33 => Address::from_compressed_bytes(bytes.try_into().expect("length checked")),
            _ => Err(SerializationError::Parse("invalid address length")),
        }
    }

    /// Checks an ECDSA signature over `message` against this point.
    pub fn verify(&self, message: &[u8], signature: &InputSignature) -> bool {
        let verifying_key =
            match VerifyingKey::from_encoded_point(&self.0.to_encoded_point(false)) {
                Ok(key) => key,
                Err(_) => return false,
            };
        match signature.to_ecdsa() {
            Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

/// Derives the address for a secret key.
pub fn address_for_key(key: &SigningKey) -> Address {
    Address(PublicKey::from(*key.verifying_key()))
}

/// Signs `message` with deterministic (RFC 6979) ECDSA.
pub fn sign(key: &SigningKey, message: &[u8]) -> InputSignature {
    let signature: Signature = key.sign(message);
    InputSignature::from_ecdsa(&signature)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_base58()).finish()
    }
}

/// Address parsing accepts the full hex form first, then base58.
impl FromStr for Address {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        address_string_to_bytes(s).and_then(|bytes| Address::from_point_bytes(&bytes))
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decodes an address string to its point bytes without checking curve
/// membership: 128 hex chars to 64 bytes, anything else via base58.
pub fn address_string_to_bytes(s: &str) -> Result<Vec<u8>, SerializationError> {
    if s.len() == 128 {
        if let Ok(bytes) = hex::decode(s) {
            return Ok(bytes);
        }
    }
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_| SerializationError::Parse("address is neither hex nor base58"))?;
    if bytes.len() != 33 {
        return Err(SerializationError::Parse("invalid address length"));
    }
    Ok(bytes)
}

/// The string form of raw address bytes, by length.
pub fn address_bytes_to_string(bytes: &[u8]) -> Result<String, SerializationError> {
    match bytes.len() {
        64 => Ok(hex::encode(bytes)),
        33 => Ok(bs58::encode(bytes).into_string()),
        _ => Err(SerializationError::Parse("invalid address length")),
    }
}

/// An ECDSA signature as it appears on the wire: two 32-byte little-endian
/// scalars.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct InputSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl InputSignature {
    pub fn from_ecdsa(signature: &Signature) -> InputSignature {
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        r.reverse();
        s.reverse();
        InputSignature { r, s }
    }

    pub fn to_ecdsa(&self) -> Result<Signature, SerializationError> {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes[..32].reverse();
        bytes[32..].reverse();
        Signature::from_slice(&bytes).map_err(|_| SerializationError::Parse("invalid signature"))
    }
}

impl fmt::Debug for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSignature")
            .field("r", &hex::encode(self.r))
            .field("s", &hex::encode(self.s))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        SigningKey::from_slice(&bytes).expect("small scalars are valid keys")
    }

    #[test]
    fn full_encoding_round_trips() {
        for seed in 1..6 {
            let address = address_for_key(&test_key(seed));
            let parsed = Address::from_full_bytes(&address.to_full_bytes()).unwrap();
            assert_eq!(parsed, address);
            assert_eq!(address.to_full_hex().parse::<Address>().unwrap(), address);
        }
    }

    #[test]
    fn compressed_encoding_recovers_the_point() {
        for seed in 1..6 {
            let address = address_for_key(&test_key(seed));
            let compressed = address.to_compressed_bytes();
            assert!(compressed[0] == EVEN_PARITY || compressed[0] == ODD_PARITY);
            let parsed = Address::from_compressed_bytes(&compressed).unwrap();
            assert_eq!(parsed, address);
            assert_eq!(address.to_base58().parse::<Address>().unwrap(), address);
        }
    }

    #[test]
    fn encodings_identify_the_same_point() {
        let address = address_for_key(&test_key(7));
        let full: Address = address.to_full_hex().parse().unwrap();
        let compressed: Address = address.to_base58().parse().unwrap();
        assert_eq!(full, compressed);
    }

    #[test]
    fn sign_and_verify() {
        let key = test_key(9);
        let address = address_for_key(&key);
        let signature = sign(&key, b"0101");
        assert!(address.verify(b"0101", &signature));
        assert!(!address.verify(b"0102", &signature));
        assert!(!address_for_key(&test_key(10)).verify(b"0101", &signature));
    }

    #[test]
    fn wrong_parity_byte_is_rejected() {
        let address = address_for_key(&test_key(3));
        let mut compressed = address.to_compressed_bytes();
        compressed[0] = 7;
        assert!(Address::from_compressed_bytes(&compressed).is_err());
    }
}
