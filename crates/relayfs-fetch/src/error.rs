//! Error types for the relayfs fetch pipeline

use thiserror::Error;

/// Failures of the sealed-payload cipher. Each validation step has its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Payload string or decoded payload is outside the accepted size range
    #[error("invalid payload length")]
    InvalidPayloadLength,
    /// Payload carries a version marker this build does not understand
    #[error("unknown encryption version")]
    UnknownVersion,
    /// Payload is not valid standard base64
    #[error("invalid base64")]
    InvalidBase64,
    /// Authentication tag mismatch: payload was tampered with or the key is wrong
    #[error("invalid MAC")]
    InvalidMac,
    /// Decrypted buffer does not carry a well-formed padding frame
    #[error("invalid padding")]
    InvalidPadding,
    /// Plaintext handed to the encryptor is empty or longer than 65535 bytes
    #[error("invalid plaintext length")]
    InvalidPlaintextLength,
}

/// All errors surfaced by index, manifest and chunk retrieval.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No matching index page or manifest was located (or it failed to parse)
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// A located record uses a protocol version other than the supported one
    #[error("unsupported protocol version: expected {expected}, got {got}")]
    UnsupportedVersion {
        /// Supported protocol version.
        expected: u32,
        /// Version found in the record.
        got: u32,
    },

    /// Malformed payload outside of index/manifest resolution
    #[error("parse error: {msg}")]
    Parse {
        /// Description of the parse failure.
        msg: String,
    },

    /// Fewer (or more) chunks were collected than the manifest announces
    #[error("chunk count mismatch: expected {expected}, got {got}")]
    ChunkCountMismatch {
        /// `total_chunks` from the manifest.
        expected: u32,
        /// Distinct chunks actually available.
        got: u32,
    },

    /// A chunk failed authenticated decryption
    #[error("decryption failed: {0}")]
    Decryption(#[from] CipherError),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// The record source (relay transport) failed
    #[error("record source error: {msg}")]
    Source {
        /// Error message reported by the source.
        msg: String,
    },

    /// A key string failed validation
    #[error("invalid key: {msg}")]
    InvalidKey {
        /// Why the key was rejected.
        msg: String,
    },

    /// File is sealed but no secret key was supplied
    #[error("file is encrypted but no secret key was provided")]
    MissingKey,

    /// Decoded bytes do not hash to the value the manifest announces
    #[error("integrity mismatch for {what}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Chunk or file the mismatch was detected on.
        what: String,
        /// Hex digest from the manifest.
        expected: String,
        /// Hex digest of the received bytes.
        actual: String,
    },

    /// File is larger than the configured preview limit
    #[error("file of {size} bytes exceeds preview limit of {limit} bytes")]
    PreviewTooLarge {
        /// Size announced by the manifest.
        size: u64,
        /// Configured `preview_max_bytes`.
        limit: u64,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl FetchError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        FetchError::NotFound { what: what.into() }
    }

    pub(crate) fn source(msg: impl Into<String>) -> Self {
        FetchError::Source { msg: msg.into() }
    }
}

/// Result alias for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
