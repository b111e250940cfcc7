//! WireGuard Key Management
//!
//! X25519 keys as they travel through settings, device state and the
//! management protocol. Keys are opaque 32-byte values; the only check
//! performed on decode is the fixed length.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Length of every WireGuard key in bytes
pub const KEY_LEN: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    key_from_slice(&bytes)
}

fn key_from_slice(bytes: &[u8]) -> Result<[u8; KEY_LEN], KeyError> {
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from an untrusted byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        key_from_slice(bytes).map(Self::from_bytes)
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from an untrusted byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        key_from_slice(bytes).map(Self::from_bytes)
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length {0} (expected 32 bytes)")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_from_private_is_stable() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn test_private_key_base64() {
        let keypair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&keypair.private.to_base64()).unwrap();

        assert_eq!(keypair.private.to_bytes(), restored.to_bytes());
        assert_eq!(restored.public_key(), keypair.public);
    }

    #[test]
    fn test_invalid_base64() {
        assert_eq!(
            PublicKey::from_base64("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        );
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert_eq!(PublicKey::from_slice(&[7u8; 31]), Err(KeyError::InvalidLength(31)));
        assert_eq!(
            PrivateKey::from_base64(&BASE64.encode([1u8; 33])).unwrap_err(),
            KeyError::InvalidLength(33)
        );
    }

    #[test]
    fn test_serde_as_base64_string() {
        let public = KeyPair::generate().public;
        let json = serde_json::to_string(&public).unwrap();

        assert_eq!(json, format!("\"{}\"", public.to_base64()));
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, public);
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let private = PrivateKey::generate();
        assert_eq!(format!("{private:?}"), "PrivateKey([redacted])");
    }
}
