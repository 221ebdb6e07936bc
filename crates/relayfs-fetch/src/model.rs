//! Index pages, manifests and chunk records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FetchError, Result};

/// Protocol version of index and manifest payloads this build understands.
pub const PROTOCOL_VERSION: u32 = 2;

/// How a file's chunks are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Chunks are plain base64.
    #[default]
    None,
    /// Chunks are sealed payloads addressed to the owner key.
    Sealed,
}

impl EncryptionMode {
    /// Tag value for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Sealed => "sealed",
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(EncryptionMode::None),
            "sealed" => Ok(EncryptionMode::Sealed),
            other => Err(FetchError::Parse {
                msg: format!("unknown encryption mode: {}", other),
            }),
        }
    }
}

/// One file in an index listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash identifying the file under its owner.
    pub hash: String,
    /// Display name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Publish time, seconds since the epoch.
    pub uploaded_at: u64,
    /// Chunk encryption mode.
    #[serde(default)]
    pub encryption: EncryptionMode,
}

/// One page of an owner's file listing. Page 1 is always the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexPage {
    /// Payload protocol version.
    pub version: u32,
    /// Files on this page, in listing order.
    pub files: Vec<FileEntry>,
    /// Archive sequence number (0 for the current page).
    #[serde(default)]
    pub archive: u32,
    /// Number of archive pages that exist behind the current page.
    #[serde(default)]
    pub total_archives: u32,
}

/// Index → record id hint for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Chunk index.
    pub index: u32,
    /// Id of the record carrying this chunk.
    pub record_id: String,
    /// Hex SHA-256 of the chunk's decoded bytes, if published.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Chunk layout and metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Payload protocol version.
    pub version: u32,
    /// Original file name.
    pub file_name: String,
    /// Content hash of the whole file (hex SHA-256).
    pub file_hash: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Nominal chunk size in bytes.
    pub chunk_size: u64,
    /// Authoritative number of chunks.
    pub total_chunks: u32,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Owner key (hex).
    pub owner: String,
    /// Chunk encryption mode.
    #[serde(default)]
    pub encryption: EncryptionMode,
    /// Optional record id hints per chunk.
    #[serde(default)]
    pub chunks: Vec<ChunkInfo>,
    /// Relays the chunks were published to.
    #[serde(default)]
    pub relays: Vec<String>,
    /// MIME type, when the publisher recorded one.
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl Manifest {
    /// Published hash of chunk `index`, if any.
    pub fn chunk_hash(&self, index: u32) -> Option<&str> {
        self.chunks
            .iter()
            .find(|c| c.index == index)
            .and_then(|c| c.hash.as_deref())
    }
}

/// One collected chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk index within the file.
    pub index: u32,
    /// Id of the record it came from.
    pub record_id: String,
    /// Base64 bytes or a sealed payload, depending on `encryption`.
    pub content: String,
    /// Encryption tag carried by the record (`none` when absent).
    pub encryption: String,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Parses a versioned JSON payload.
///
/// A readable `version` other than `PROTOCOL_VERSION` is fatal. Anything else
/// that fails to parse is reported as `NotFound` for `what`.
pub(crate) fn parse_versioned<T>(content: &str, what: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(probe) = serde_json::from_str::<VersionProbe>(content) {
        if probe.version != PROTOCOL_VERSION {
            return Err(FetchError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: probe.version,
            });
        }
    }
    serde_json::from_str(content).map_err(|e| {
        tracing::debug!(what, error = %e, "payload failed to parse");
        FetchError::not_found(what)
    })
}
