//! Owner and secret key handling.
//!
//! Keys arrive as 64-character hex strings. Only pass/fail validation is done
//! here; conversion from other human-readable encodings happens upstream.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an x-only public key or secret key in bytes.
pub const KEY_SIZE: usize = 32;

/// Public identity under which index, manifest and chunk records are published.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerKey {
    hex: String,
    bytes: [u8; KEY_SIZE],
}

impl OwnerKey {
    /// Parses and validates a hex x-only secp256k1 public key.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = decode_key_hex(s)?;
        secp256k1::XOnlyPublicKey::from_slice(&bytes).map_err(|e| FetchError::InvalidKey {
            msg: format!("not a curve point: {}", e),
        })?;
        Ok(Self {
            hex: s.to_ascii_lowercase(),
            bytes,
        })
    }

    /// Lowercase hex form, as used in record filters.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Raw x-only key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl TryFrom<String> for OwnerKey {
    type Error = FetchError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<OwnerKey> for String {
    fn from(key: OwnerKey) -> Self {
        key.hex
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKey({})", self.hex)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// Secret key used to open sealed chunks. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Parses and validates a hex secp256k1 secret key.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = decode_key_hex(s)?;
        Self::from_bytes(bytes)
    }

    /// Validates raw secret key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Result<Self> {
        secp256k1::SecretKey::from_slice(&bytes).map_err(|e| FetchError::InvalidKey {
            msg: format!("secret key out of range: {}", e),
        })?;
        Ok(Self(bytes))
    }

    /// Raw secret key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the matching owner (x-only public) key.
    pub fn owner_key(&self) -> Result<OwnerKey> {
        let secp = secp256k1::Secp256k1::signing_only();
        let sk = secp256k1::SecretKey::from_slice(&self.0).map_err(|e| FetchError::InvalidKey {
            msg: e.to_string(),
        })?;
        let (xonly, _) = secp256k1::PublicKey::from_secret_key(&secp, &sk).x_only_public_key();
        let bytes = xonly.serialize();
        Ok(OwnerKey {
            hex: hex::encode(bytes),
            bytes,
        })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

fn decode_key_hex(s: &str) -> Result<[u8; KEY_SIZE]> {
    if s.len() != KEY_SIZE * 2 {
        return Err(FetchError::InvalidKey {
            msg: format!("expected {} hex characters, got {}", KEY_SIZE * 2, s.len()),
        });
    }
    let mut bytes = [0u8; KEY_SIZE];
    hex::decode_to_slice(s, &mut bytes).map_err(|e| FetchError::InvalidKey {
        msg: e.to_string(),
    })?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    // x coordinate of the secp256k1 generator point
    const GENERATOR_X: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    #[test]
    fn secret_key_derives_generator_for_one() {
        let sk = SecretKey::parse(SECRET).unwrap();
        assert_eq!(sk.owner_key().unwrap().as_hex(), GENERATOR_X);
    }

    #[test]
    fn owner_key_normalises_case() {
        let key = OwnerKey::parse(&GENERATOR_X.to_uppercase()).unwrap();
        assert_eq!(key.as_hex(), GENERATOR_X);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            OwnerKey::parse("abcd"),
            Err(FetchError::InvalidKey { .. })
        ));
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "zz".repeat(32);
        assert!(OwnerKey::parse(&bad).is_err());
        assert!(SecretKey::parse(&bad).is_err());
    }

    #[test]
    fn rejects_zero_secret() {
        assert!(SecretKey::parse(&"0".repeat(64)).is_err());
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let sk = SecretKey::parse(SECRET).unwrap();
        assert_eq!(format!("{:?}", sk), "SecretKey([REDACTED])");
    }

    #[test]
    fn owner_key_serde_round_trips_as_string() {
        let key = OwnerKey::parse(GENERATOR_X).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", GENERATOR_X));
        let back: OwnerKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
