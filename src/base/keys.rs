//! Ed25519 keys bound to a network id.
//!
//! Every signature covers `SHA256(SHA256(msg ‖ network_id))`, so a sign made
//! for one chain never verifies on another.

use super::BaseError;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::str::FromStr;

pub const MAX_NETWORK_ID_LEN: usize = 256;
pub const MIN_SEED_LEN: usize = 36;

const ED25519_SCHEME: &str = "ed25519";
const SIGNATURE_LEN: usize = 64;

/// Opaque chain identifier prepended to everything signed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Result<Self, BaseError> {
        let id = id.into();
        if id.is_empty() {
            return Err(BaseError::InvalidNetworkId("empty".to_string()));
        }
        if id.len() > MAX_NETWORK_ID_LEN {
            return Err(BaseError::InvalidNetworkId(format!(
                "too long, {} > {}",
                id.len(),
                MAX_NETWORK_ID_LEN
            )));
        }
        Ok(NetworkId(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for NetworkId {
    type Error = BaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NetworkId::new(value)
    }
}

impl From<NetworkId> for String {
    fn from(id: NetworkId) -> Self {
        id.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn signing_digest(network_id: &NetworkId, msg: &[u8]) -> [u8; 32] {
    let mut inner = Sha256::new();
    inner.update(msg);
    inner.update(network_id.as_bytes());
    Sha256::digest(inner.finalize()).into()
}

#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        PrivateKey {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic key from a high-entropy seed; the seed is hashed down to
    /// the 32-byte secret.
    pub fn from_seed(seed: &[u8]) -> Result<Self, BaseError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(BaseError::InvalidSeed {
                found: seed.len(),
                min: MIN_SEED_LEN,
            });
        }
        let secret: [u8; 32] = Sha256::digest(seed).into();
        Ok(PrivateKey {
            key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, network_id: &NetworkId, msg: &[u8]) -> Signature {
        let digest = signing_digest(network_id, msg);
        Signature(self.key.sign(&digest).to_bytes().to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({})", self.public_key())
    }
}

#[derive(Clone, Copy)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BaseError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BaseError::InvalidPublicKey(format!("wrong length, {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| BaseError::InvalidPublicKey(e.to_string()))?;
        Ok(PublicKey { key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verify(&self, network_id: &NetworkId, msg: &[u8], sig: &Signature) -> Result<(), BaseError> {
        let arr: [u8; SIGNATURE_LEN] = sig
            .0
            .as_slice()
            .try_into()
            .map_err(|_| BaseError::InvalidSignature(format!("wrong length, {}", sig.0.len())))?;
        let digest = signing_digest(network_id, msg);
        self.key
            .verify(&digest, &ed25519_dalek::Signature::from_bytes(&arr))
            .map_err(|_| BaseError::SignatureVerification)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl StdHash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ED25519_SCHEME, hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.to_bytes())[..12])
    }
}

impl FromStr for PublicKey {
    type Err = BaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, body)) = s.split_once(':') else {
            return Err(BaseError::InvalidPublicKey(format!("missing scheme, {s:?}")));
        };
        if scheme != ED25519_SCHEME {
            return Err(BaseError::InvalidPublicKey(format!("unknown scheme, {scheme:?}")));
        }
        PublicKey::from_bytes(&hex::decode(body)?)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(&self.0);
        write!(f, "Signature({})", &h[..h.len().min(12)])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map(Signature).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkId {
        NetworkId::new("n").unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let pk = PrivateKey::generate();
        let sig = pk.sign(&network(), b"payload");
        assert!(pk.public_key().verify(&network(), b"payload", &sig).is_ok());
        assert!(pk.public_key().verify(&network(), b"other", &sig).is_err());
    }

    #[test]
    fn signature_is_bound_to_network_id() {
        let pk = PrivateKey::generate();
        let sig = pk.sign(&network(), b"payload");
        let other = NetworkId::new("m").unwrap();
        assert!(matches!(
            pk.public_key().verify(&other, b"payload", &sig),
            Err(BaseError::SignatureVerification)
        ));
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = b"a very long seed phrase with enough entropy inside";
        let a = PrivateKey::from_seed(seed).unwrap();
        let b = PrivateKey::from_seed(seed).unwrap();
        assert_eq!(a.public_key(), b.public_key());

        assert!(matches!(
            PrivateKey::from_seed(b"short"),
            Err(BaseError::InvalidSeed { found: 5, .. })
        ));
    }

    #[test]
    fn public_key_printable_form() {
        let pub_key = PrivateKey::generate().public_key();
        let s = pub_key.to_string();
        assert!(s.starts_with("ed25519:"));
        assert_eq!(s.parse::<PublicKey>().unwrap(), pub_key);
        assert!("secp256k1:00".parse::<PublicKey>().is_err());
    }

    #[test]
    fn network_id_limits() {
        assert!(NetworkId::new("").is_err());
        assert!(NetworkId::new("x".repeat(MAX_NETWORK_ID_LEN + 1)).is_err());
        assert!(NetworkId::new("x".repeat(MAX_NETWORK_ID_LEN)).is_ok());
    }
}
