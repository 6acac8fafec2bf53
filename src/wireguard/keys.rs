//! WireGuard key material
//!
//! Private keys, public keys and pre-shared keys in the protocol's native
//! base64 encoding, plus the `KeyMaterialProvider` seam the registry draws
//! fresh keys from.

use crate::error::{ProvisionError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Decode a base64 WireGuard key into its 32 raw bytes
fn decode_key(kind: &str, s: &str) -> Result<[u8; 32]> {
    let decoded = BASE64
        .decode(s.trim())
        .map_err(|e| ProvisionError::Validation(format!("Invalid base64 {}: {}", kind, e)))?;

    if decoded.len() != 32 {
        return Err(ProvisionError::Validation(format!(
            "Invalid {} length: expected 32 bytes, got {}",
            kind,
            decoded.len()
        )));
    }

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key("private key", s).map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        *self.secret == *other.secret
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; 32],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key("public key", s).map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Symmetric pre-shared key mixed into the handshake
#[derive(Clone)]
pub struct PresharedKey {
    key: Zeroizing<[u8; 32]>,
}

impl PresharedKey {
    /// Create a pre-shared key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Parse a pre-shared key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key("preshared key", s).map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.key)
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        *self.key == *other.key
    }
}

impl Eq for PresharedKey {}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey([REDACTED])")
    }
}

macro_rules! base64_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let encoded = Zeroizing::new(String::deserialize(deserializer)?);
                <$ty>::from_base64(&encoded).map_err(de::Error::custom)
            }
        }
    };
}

base64_serde!(PrivateKey);
base64_serde!(PublicKey);
base64_serde!(PresharedKey);

/// WireGuard key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    /// Private key
    pub private: PrivateKey,
    /// Public key (derived from private)
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create a key pair from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// Source of fresh key material for new and rotated peers
///
/// Any failure must be reported as `KeyGenerationFailed` so the enclosing
/// registry transaction is abandoned.
#[cfg_attr(test, mockall::automock)]
pub trait KeyMaterialProvider: Send + Sync {
    /// Produce a new x25519 key pair
    fn generate_keypair(&self) -> Result<KeyPair>;

    /// Produce a new 32-byte pre-shared key
    fn generate_preshared_key(&self) -> Result<PresharedKey>;
}

/// In-process key generation using x25519-dalek and the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeKeyProvider;

impl KeyMaterialProvider for NativeKeyProvider {
    fn generate_keypair(&self) -> Result<KeyPair> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| ProvisionError::KeyGenerationFailed(e.to_string()))?;
        // StaticSecret clamps on use, so any 32 random bytes are a valid key
        let secret = StaticSecret::from(*bytes);
        Ok(KeyPair::from_private(PrivateKey::from_bytes(secret.to_bytes())))
    }

    fn generate_preshared_key(&self) -> Result<PresharedKey> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| ProvisionError::KeyGenerationFailed(e.to_string()))?;
        let psk = PresharedKey::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        Ok(psk)
    }
}
