//! The content-addressed identifier used by seals, trees and blobs.

use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error, Formatter};
use std::str::FromStr;

pub const HASH_SIZE: usize = 32;

/// A 32-byte content hash. Equality is bytewise; there is no notion of
/// ordering beyond what's needed to put hashes in sorted containers.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub const fn zero() -> Self {
        Hash::new([0; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Hash an arbitrary byte slice into a content address.
#[inline(always)]
pub fn hash(value: &[u8]) -> Hash {
    let result: [u8; HASH_SIZE] = blake3::hash(value).into();
    Hash(result)
}

/// Types that derive their hash from their canonical byte encoding.
pub trait Hashable {
    fn canonical_bytes(&self) -> Vec<u8>;

    fn content_hash(&self) -> Hash {
        hash(&self.canonical_bytes())
    }
}

impl FromStr for Hash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex string")?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| "hash must be 32 bytes")?;
        Ok(Hash::new(bytes))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::zero()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let text = String::deserialize(deserializer)?;
        if text.len() != HASH_SIZE * 2 {
            return Err(SerdeError::custom("invalid hex length for Hash"));
        }
        let bytes = hex::decode(&text).map_err(SerdeError::custom)?;
        let bytes: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| SerdeError::custom("could not convert hex to 32-byte array"))?;
        Ok(Hash::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_zero() {
        assert!(Hash::zero().is_zero());
        assert!(!hash(b"not zero").is_zero());
    }

    #[test]
    fn hex_round_trip() {
        let h = hash(b"ivaldi");
        let text = h.to_hex();
        let parsed: Hash = text.parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn serde_round_trip() {
        let h = hash(b"seal contents");
        let json = serde_json::to_string(&h).unwrap();
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn deterministic() {
        assert_eq!(hash(b"abc"), hash(b"abc"));
        assert_ne!(hash(b"abc"), hash(b"abd"));
    }
}
