use std::fmt;
use std::str::FromStr;

use serde::de;

use crate::serialization::SerializationError;

/// A mining difficulty with one fractional decimal digit, stored as tenths.
///
/// The integer part is the number of hex characters of the previous block
/// hash a new hash must chain onto; the fractional digit narrows the
/// character set allowed at the next position. On the wire the header
/// carries `difficulty * 10` as a 2-byte little-endian integer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Difficulty(u16);

impl Difficulty {
    pub const fn from_tenths(tenths: u16) -> Difficulty {
        Difficulty(tenths)
    }

    pub fn tenths(&self) -> u16 {
        self.0
    }

    /// `floor(difficulty)`: how many hex chars must chain.
    pub fn integer(&self) -> usize {
        (self.0 / 10) as usize
    }

    /// The fractional digit, 0–9.
    pub fn fractional_tenths(&self) -> u8 {
        (self.0 % 10) as u8
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 10.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

impl FromStr for Difficulty {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (integer, frac) = match s.split_once('.') {
            Some((integer, frac)) => (integer, frac),
            None => (s, "0"),
        };
        if frac.len() != 1 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(SerializationError::Parse("difficulty needs one decimal digit"));
        }
        let integer: u16 = integer
            .parse()
            .map_err(|_| SerializationError::Parse("invalid difficulty"))?;
        let frac: u16 = frac.parse().expect("single digit checked above");
        Ok(Difficulty(integer * 10 + frac))
    }
}

impl serde::Serialize for Difficulty {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> serde::Deserialize<'de> for Difficulty {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DifficultyVisitor;

        impl<'de> de::Visitor<'de> for DifficultyVisitor {
            type Value = Difficulty;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a difficulty as a number or string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Difficulty, E> {
                if !v.is_finite() || !(0.0..=6553.0).contains(&v) {
                    return Err(de::Error::custom("difficulty out of range"));
                }
                Ok(Difficulty((v * 10.0).round() as u16))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Difficulty, E> {
                self.visit_f64(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Difficulty, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(DifficultyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_and_display() {
        let difficulty: Difficulty = "6.5".parse().unwrap();
        assert_eq!(difficulty.integer(), 6);
        assert_eq!(difficulty.fractional_tenths(), 5);
        assert_eq!(difficulty.to_string(), "6.5");
        assert_eq!("6".parse::<Difficulty>().unwrap().to_string(), "6.0");
    }
}
