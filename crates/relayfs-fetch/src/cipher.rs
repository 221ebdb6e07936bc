//! Sealed chunk payloads: secp256k1 ECDH + HKDF-SHA256, ChaCha20, HMAC-SHA256.
//!
//! Payload layout after base64 decoding:
//!
//! ```text
//! [ version (1) | nonce (32) | ciphertext (padded plaintext) | mac (32) ]
//! ```
//!
//! The padded plaintext is a big-endian `u16` length prefix followed by the
//! message and zero bytes up to `padded_len(message_len)`.

use crate::error::{CipherError, FetchError};
use crate::keys::{OwnerKey, SecretKey};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Only supported payload format version.
pub const PAYLOAD_VERSION: u8 = 2;

/// Salt used when extracting the conversation key.
const CONVERSATION_SALT: &[u8] = b"nip44-v2";

const NONCE_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
const MESSAGE_KEYS_SIZE: usize = 76;

const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;

/// Accepted base64 payload length range, in characters.
pub const PAYLOAD_CHARS: std::ops::RangeInclusive<usize> = 132..=87472;
/// Accepted decoded payload length range, in bytes.
pub const PAYLOAD_BYTES: std::ops::RangeInclusive<usize> = 99..=65603;

/// Symmetric key shared by a key pair, input to per-message key derivation.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Derives the conversation key for `secret` talking to `peer`.
    ///
    /// For self-sealed files `peer` is the owner key of `secret` itself.
    pub fn derive(secret: &SecretKey, peer: &OwnerKey) -> Result<Self, FetchError> {
        let sk = secp256k1::SecretKey::from_slice(secret.as_bytes()).map_err(|e| {
            FetchError::InvalidKey { msg: e.to_string() }
        })?;
        let mut compressed = [0u8; 33];
        compressed[0] = 0x02;
        compressed[1..].copy_from_slice(peer.as_bytes());
        let pk = secp256k1::PublicKey::from_slice(&compressed).map_err(|e| {
            FetchError::InvalidKey { msg: e.to_string() }
        })?;

        let mut point = secp256k1::ecdh::shared_secret_point(&pk, &sk);
        let (prk, _) = Hkdf::<Sha256>::extract(Some(CONVERSATION_SALT), &point[..32]);
        point.zeroize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Ok(Self(key))
    }

    /// Wraps already-derived key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversationKey([REDACTED])")
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

fn message_keys(key: &ConversationKey, nonce: &[u8]) -> MessageKeys {
    let hk = Hkdf::<Sha256>::from_prk(&key.0).expect("PRK is one hash length");
    let mut okm = [0u8; MESSAGE_KEYS_SIZE];
    hk.expand(nonce, &mut okm).expect("HKDF expand failed");

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[0..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..76]);
    okm.zeroize();
    keys
}

fn mac_for(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> HmacSha256 {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(hmac_key).expect("HMAC accepts keys of any length");
    mac.update(nonce);
    mac.update(ciphertext);
    mac
}

/// Padded size of a message of `unpadded_len` bytes (excluding the length prefix).
pub fn padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = unpadded_len.next_power_of_two();
    let bucket = if next_power <= 256 { 32 } else { next_power / 8 };
    bucket * ((unpadded_len - 1) / bucket + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(CipherError::InvalidPlaintextLength);
    }
    let mut padded = Vec::with_capacity(2 + padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, CipherError> {
    if padded.len() < 2 {
        return Err(CipherError::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN {
        return Err(CipherError::InvalidPadding);
    }
    let message = padded
        .get(2..2 + len)
        .ok_or(CipherError::InvalidPadding)?;
    if message.len() != len || padded.len() != 2 + padded_len(len) {
        return Err(CipherError::InvalidPadding);
    }
    Ok(message.to_vec())
}

/// Opens a sealed payload.
///
/// Validation runs in a fixed order and the MAC is verified before any
/// decryption takes place.
pub fn decrypt(payload: &str, key: &ConversationKey) -> Result<Vec<u8>, CipherError> {
    if !PAYLOAD_CHARS.contains(&payload.len()) {
        return Err(CipherError::InvalidPayloadLength);
    }
    if payload.starts_with('#') {
        return Err(CipherError::UnknownVersion);
    }
    let data = STANDARD
        .decode(payload)
        .map_err(|_| CipherError::InvalidBase64)?;
    if !PAYLOAD_BYTES.contains(&data.len()) {
        return Err(CipherError::InvalidPayloadLength);
    }
    if data[0] != PAYLOAD_VERSION {
        return Err(CipherError::UnknownVersion);
    }

    let nonce = &data[1..1 + NONCE_SIZE];
    let ciphertext = &data[1 + NONCE_SIZE..data.len() - MAC_SIZE];
    let tag = &data[data.len() - MAC_SIZE..];

    let keys = message_keys(key, nonce);
    mac_for(&keys.hmac_key, nonce, ciphertext)
        .verify_slice(tag)
        .map_err(|_| CipherError::InvalidMac)?;

    let mut padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    let plaintext = unpad(&padded);
    padded.zeroize();
    plaintext
}

/// Convenience wrapper deriving the conversation key first.
pub fn decrypt_with_keys(
    payload: &str,
    secret: &SecretKey,
    peer: &OwnerKey,
) -> Result<Vec<u8>, FetchError> {
    let key = ConversationKey::derive(secret, peer)?;
    Ok(decrypt(payload, &key)?)
}

/// Seals `plaintext` with a caller-chosen nonce.
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    key: &ConversationKey,
    nonce: &[u8; NONCE_SIZE],
) -> Result<String, CipherError> {
    let keys = message_keys(key, nonce);
    let mut ciphertext = pad(plaintext)?;
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    let tag = mac_for(&keys.hmac_key, nonce, &ciphertext).finalize().into_bytes();

    let mut data = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    data.push(PAYLOAD_VERSION);
    data.extend_from_slice(nonce);
    data.extend_from_slice(&ciphertext);
    data.extend_from_slice(&tag);
    Ok(STANDARD.encode(data))
}

/// Seals `plaintext` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &ConversationKey) -> Result<String, CipherError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, key, &nonce)
}
