//! Fixed-point currency amounts.
//!
//! Amounts are stored and transmitted in "smallest units": one coin is
//! [`SMALLEST`] units. On the wire an amount is a one-byte length prefix
//! followed by that many little-endian bytes, using the minimal length.

use std::fmt;
use std::str::FromStr;

use serde::de;

use crate::serialization::{DenaroDeserialize, DenaroSerialize, SerializationError};

/// Number of smallest units per coin.
pub const SMALLEST: u64 = 1_000_000;

/// A non-negative currency amount in smallest units.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// An amount counted directly in smallest units.
    pub fn from_smallest(units: u64) -> Amount {
        Amount(units)
    }

    /// An amount of whole coins.
    pub fn from_coins(coins: u64) -> Amount {
        Amount(coins * SMALLEST)
    }

    pub fn smallest(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// The minimal number of bytes needed to hold this amount on the wire.
    /// Zero encodes as zero bytes.
    pub fn byte_length(&self) -> u8 {
        ((64 - self.0.leading_zeros() + 7) / 8) as u8
    }
}

impl DenaroSerialize for Amount {
    fn denaro_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        let len = self.byte_length();
        len.denaro_serialize(&mut target)?;
        target.write_all(&self.0.to_le_bytes()[..len as usize])
    }
}

impl DenaroDeserialize for Amount {
    fn denaro_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let len = u8::denaro_deserialize(&mut reader)?;
        if len > 8 {
            return Err(SerializationError::Parse("amount is wider than 8 bytes"));
        }
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes[..len as usize])?;
        Ok(Amount(u64::from_le_bytes(bytes)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coins = self.0 / SMALLEST;
        let frac = self.0 % SMALLEST;
        if frac == 0 {
            return write!(f, "{}", coins);
        }
        let frac = format!("{:06}", frac);
        write!(f, "{}.{}", coins, frac.trim_end_matches('0'))
    }
}

/// Parses a decimal coin amount, e.g. `100` or `0.390625`.
///
/// More than six fractional digits cannot be represented in smallest units
/// and is an error, matching the integrality rule for fees.
impl FromStr for Amount {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (coins, frac) = match s.split_once('.') {
            Some((coins, frac)) => (coins, frac),
            None => (s, ""),
        };
        if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(SerializationError::Parse("invalid fractional amount"));
        }
        let coins: u64 = coins
            .parse()
            .map_err(|_| SerializationError::Parse("invalid amount"))?;
        let mut frac_units = 0u64;
        if !frac.is_empty() {
            let padded = format!("{:0<6}", frac);
            frac_units = padded
                .parse()
                .map_err(|_| SerializationError::Parse("invalid amount"))?;
        }
        coins
            .checked_mul(SMALLEST)
            .and_then(|units| units.checked_add(frac_units))
            .map(Amount)
            .ok_or(SerializationError::Parse("amount overflow"))
    }
}

impl serde::Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Amounts in peer JSON may be decimal strings (our own encoding) or bare
/// numbers (other implementations), so accept both.
impl<'de> serde::Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a decimal amount as a string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from_coins(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(de::Error::custom("invalid amount"));
                }
                Ok(Amount((v * SMALLEST as f64).round() as u64))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(Amount::from_coins(100).to_string(), "100");
        assert_eq!(Amount::from_smallest(390_625).to_string(), "0.390625");
        assert_eq!(Amount::from_smallest(1_500_000).to_string(), "1.5");
        assert_eq!(Amount::ZERO.to_string(), "0");
    }

    #[test]
    fn parse_round_trips_display() {
        for amount in [
            Amount::ZERO,
            Amount::from_smallest(1),
            Amount::from_smallest(312_500),
            Amount::from_coins(30_062_005),
        ] {
            assert_eq!(amount.to_string().parse::<Amount>().unwrap(), amount);
        }
        assert!("1.2345678".parse::<Amount>().is_err());
        assert!("-3".parse::<Amount>().is_err());
    }

    #[test]
    fn wire_encoding_is_minimal() {
        let bytes = Amount::from_smallest(0x0102)
            .denaro_serialize_to_vec()
            .unwrap();
        assert_eq!(bytes, vec![2, 0x02, 0x01]);
        assert_eq!(Amount::ZERO.denaro_serialize_to_vec().unwrap(), vec![0]);

        let decoded = Amount::denaro_deserialize(&bytes[..]).unwrap();
        assert_eq!(decoded, Amount::from_smallest(0x0102));
    }
}
