//! A set of types and functions related to cryptography, that are widely used in the entire Vivace project.
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// When the data format is not valid.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("verification failed")]
    VerificationFailed,
}

type Error = CryptoError;

pub trait ToHash256 {
    fn to_hash256(&self) -> Hash256;
}

fn serialize_hex<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(hex::encode(data).as_str())
}

fn deserialize_hex<'de, D: serde::Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(s).map_err(|e| serde::de::Error::custom(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom("invalid length"))
}

/// A 32-byte Keccak256 hash.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const fn zero() -> Self {
        Hash256([0; 32])
    }

    /// Hashes the given data.
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        Hash256(hasher.finalize().into())
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        let data: [u8; 32] = slice
            .try_into()
            .map_err(|_| Error::InvalidFormat(format!("invalid hash length {}", slice.len())))?;
        Ok(Hash256(data))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Hash256(deserialize_hex(deserializer)?))
    }
}

/// An ed25519 public key, which also serves as a node/process identity.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub const fn zero() -> Self {
        PublicKey([0; 32])
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        let data: [u8; 32] = slice
            .try_into()
            .map_err(|_| Error::InvalidFormat(format!("invalid key length {}", slice.len())))?;
        Ok(PublicKey(data))
    }

    /// Verifies a signature made by the private counterpart of this key.
    pub fn verify(&self, message: impl AsRef<[u8]>, signature: &Signature) -> Result<(), Error> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message.as_ref(), &signature)
            .map_err(|_| Error::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(PublicKey(deserialize_hex(deserializer)?))
    }
}

/// An ed25519 signature.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub const fn zero() -> Self {
        Signature([0; 64])
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        let data: [u8; 64] = slice.try_into().map_err(|_| {
            Error::InvalidFormat(format!("invalid signature length {}", slice.len()))
        })?;
        Ok(Signature(data))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0).as_str())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Signature(deserialize_hex(deserializer)?))
    }
}

/// An ed25519 key pair held by this node (a harvester or boot key).
#[derive(Clone)]
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    pub fn generate<R: rand_core::CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Keypair {
            signing: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Keypair {
            signing: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: impl AsRef<[u8]>) -> Signature {
        Signature(self.signing.sign(message.as_ref()).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Keypair {
        Keypair::from_seed([7; 32])
    }

    #[test]
    fn generated_keypair_signs_and_verifies() {
        let keypair = Keypair::generate(&mut rand::rngs::OsRng);
        let signature = keypair.sign(b"fresh key");
        keypair.public_key().verify(b"fresh key", &signature).unwrap();
    }

    #[test]
    fn sign_and_verify() {
        let keypair = keypair();
        let signature = keypair.sign(b"hello");
        keypair.public_key().verify(b"hello", &signature).unwrap();
        assert!(keypair.public_key().verify(b"hullo", &signature).is_err());
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let signature = keypair().sign(b"hello");
        let other = Keypair::from_seed([8; 32]);
        assert!(other.public_key().verify(b"hello", &signature).is_err());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(Hash256::hash(b"vivace"), Hash256::hash(b"vivace"));
        assert_ne!(Hash256::hash(b"vivace"), Hash256::hash(b"adagio"));
    }

    #[test]
    fn en_decode_public_key() {
        let key = keypair().public_key();
        let serialized = serde_json::to_string(&key).unwrap();
        let deserialized: PublicKey = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, key);
    }
}
