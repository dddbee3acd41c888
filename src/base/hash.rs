use super::BaseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const HASH_LEN: usize = 32;

/// SHA-256 digest. The all-zero value is the empty hash and never valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub const EMPTY: Hash = Hash([0; HASH_LEN]);

    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// SHA-256 of one byte slice.
    pub fn digest(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }

    /// SHA-256 over the concatenation of `parts`, without building the
    /// concatenated buffer.
    pub fn digest_parts<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_ref());
        }
        Hash(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, BaseError> {
        let arr: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| BaseError::InvalidHash(format!("wrong length, {}", bytes.len())))?;
        Ok(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    pub fn is_valid(&self) -> Result<(), BaseError> {
        if self.is_empty() {
            return Err(BaseError::EmptyHash);
        }
        Ok(())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl FromStr for Hash {
    type Err = BaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_parts_matches_concatenation() {
        let whole = Hash::digest(b"hello world");
        let parts = Hash::digest_parts([b"hello".as_slice(), b" ".as_slice(), b"world".as_slice()]);
        assert_eq!(whole, parts);
        assert!(whole.is_valid().is_ok());
    }

    #[test]
    fn empty_hash_is_invalid() {
        assert!(Hash::EMPTY.is_empty());
        assert!(matches!(Hash::EMPTY.is_valid(), Err(BaseError::EmptyHash)));
    }

    #[test]
    fn hex_roundtrip_through_json() {
        let h = Hash::digest(b"isaac");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);

        assert!("abcd".parse::<Hash>().is_err());
    }
}
