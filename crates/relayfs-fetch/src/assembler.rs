//! File assembly: order chunks by index, decode or decrypt, concatenate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cipher::{self, ConversationKey};
use crate::error::{FetchError, Result};
use crate::model::{ChunkRecord, EncryptionMode, Manifest};

/// Builds the final byte buffer of one file.
pub struct Assembler<'a> {
    total_chunks: u32,
    mode: EncryptionMode,
    key: Option<&'a ConversationKey>,
    manifest: Option<&'a Manifest>,
}

impl<'a> Assembler<'a> {
    /// Assembler for a file of `total_chunks` chunks stored as `mode`.
    pub fn new(total_chunks: u32, mode: EncryptionMode) -> Self {
        Self {
            total_chunks,
            mode,
            key: None,
            manifest: None,
        }
    }

    /// Assembler configured from a manifest.
    pub fn for_manifest(manifest: &'a Manifest) -> Self {
        Self::new(manifest.total_chunks, manifest.encryption)
    }

    /// Key used to open sealed chunks.
    pub fn with_key(mut self, key: &'a ConversationKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Verifies chunk and file digests published in `manifest`.
    pub fn verify_against(mut self, manifest: &'a Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Assembles `chunks`. Fails without producing partial output when any
    /// chunk is missing or cannot be decoded.
    pub fn assemble(&self, chunks: &[ChunkRecord]) -> Result<Vec<u8>> {
        if chunks.len() != self.total_chunks as usize {
            return Err(FetchError::ChunkCountMismatch {
                expected: self.total_chunks,
                got: chunks.len() as u32,
            });
        }

        let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.index);
        if ordered
            .iter()
            .enumerate()
            .any(|(pos, c)| c.index as usize != pos)
        {
            return Err(FetchError::ChunkCountMismatch {
                expected: self.total_chunks,
                got: distinct_in_range(&ordered, self.total_chunks),
            });
        }

        let key = match self.mode {
            EncryptionMode::Sealed => Some(self.key.ok_or(FetchError::MissingKey)?),
            EncryptionMode::None => None,
        };

        let mut out = Vec::new();
        for chunk in ordered {
            let bytes = match key {
                Some(key) => cipher::decrypt(&chunk.content, key)?,
                None => STANDARD.decode(chunk.content.trim()).map_err(|e| {
                    FetchError::Parse {
                        msg: format!("chunk {}: invalid base64: {}", chunk.index, e),
                    }
                })?,
            };
            if let Some(expected) = self.manifest.and_then(|m| m.chunk_hash(chunk.index)) {
                check_digest(&format!("chunk {}", chunk.index), expected, &bytes)?;
            }
            out.extend_from_slice(&bytes);
        }

        if let Some(manifest) = self.manifest {
            check_digest(&manifest.file_name, &manifest.file_hash, &out)?;
        }

        debug!(
            chunks = self.total_chunks,
            bytes = out.len(),
            mode = %self.mode,
            "file assembled"
        );
        Ok(out)
    }
}

fn distinct_in_range(ordered: &[&ChunkRecord], total: u32) -> u32 {
    let mut indices: Vec<u32> = ordered
        .iter()
        .map(|c| c.index)
        .filter(|i| *i < total)
        .collect();
    indices.dedup();
    indices.len() as u32
}

fn check_digest(what: &str, expected: &str, bytes: &[u8]) -> Result<()> {
    let actual = hex::encode(Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(FetchError::IntegrityMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
