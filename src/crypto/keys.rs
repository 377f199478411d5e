//! Curve25519 identity keys
//!
//! Two opaque 32-byte types that share a layout but are never
//! interchangeable. Private keys are clamped to the standard Curve25519
//! bit pattern on every construction path; the public key is the X25519
//! scalar base multiplication of the private scalar.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of both key types in bytes.
pub const KEY_LEN: usize = 32;

/// A node's secret identity scalar.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_LEN]);

/// A node's public identity, derived from its private key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

fn decode_base64(src: &str) -> Result<[u8; KEY_LEN]> {
    let raw = BASE64
        .decode(src)
        .map_err(|e| Error::Config(format!("invalid key: {}", e)))?;
    raw.try_into()
        .map_err(|_| Error::Config("keys must decode to exactly 32 bytes".into()))
}

fn decode_hex(src: &str) -> Result<[u8; KEY_LEN]> {
    let raw = hex::decode(src).map_err(|e| Error::Config(format!("invalid key: {}", e)))?;
    raw.try_into()
        .map_err(|_| Error::Config("keys must decode to exactly 32 bytes".into()))
}

impl PrivateKey {
    /// Generate a fresh private key from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Build from raw bytes, applying clamping.
    pub fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
        clamp(&mut bytes);
        Self(bytes)
    }

    pub fn from_base64(src: &str) -> Result<Self> {
        Ok(Self::from_bytes(decode_base64(src)?))
    }

    pub fn from_hex(src: &str) -> Result<Self> {
        Ok(Self::from_bytes(decode_hex(src)?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Derive the matching public key by X25519 scalar base mult.
    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(src: &str) -> Result<Self> {
        Ok(Self(decode_base64(src)?))
    }

    pub fn from_hex(src: &str) -> Result<Self> {
        Ok(Self(decode_hex(src)?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Standard Curve25519 clamping: clear the low three bits of byte 0,
/// clear the top bit and set bit 6 of byte 31.
fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[31] = (bytes[31] & 127) | 64;
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret scalar.
        write!(f, "PrivateKey(..)")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip_is_identity_on_clamped_keys() {
        let key = PrivateKey::generate();
        let decoded = PrivateKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn clamping_is_applied_on_decode() {
        let key = PrivateKey::from_bytes([0xff; KEY_LEN]);
        assert_eq!(key.as_bytes()[0] & 7, 0);
        assert_eq!(key.as_bytes()[31] & 128, 0);
        assert_eq!(key.as_bytes()[31] & 64, 64);
    }

    #[test]
    fn public_key_is_deterministic_and_nonzero() {
        let key = PrivateKey::generate();
        let a = key.public_key();
        let b = key.public_key();
        assert_eq!(a, b);
        assert_ne!(a.as_bytes(), &[0u8; KEY_LEN]);
    }

    #[test]
    fn hex_and_base64_agree() {
        let key = PrivateKey::generate();
        let hex_src = hex::encode(key.as_bytes());
        let from_hex = PrivateKey::from_hex(&hex_src).unwrap();
        assert_eq!(key, from_hex);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(PublicKey::from_base64("c2hvcnQ=").is_err());
        assert!(PrivateKey::from_hex("abcd").is_err());
    }

    #[test]
    fn public_decode_does_not_derive() {
        // Parsing a private key's encoding as a PublicKey yields the raw
        // bytes, not the derived key.
        let private = PrivateKey::generate();
        let parsed = PublicKey::from_base64(&private.to_base64()).unwrap();
        assert_eq!(parsed.as_bytes(), private.as_bytes());
        assert_ne!(parsed.as_bytes(), private.public_key().as_bytes());
    }
}
