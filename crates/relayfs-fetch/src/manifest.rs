//! Manifest resolution.
//!
//! Publishers tag manifests either with a content tag or with an identifier
//! tag carrying the content hash. Both are tried, in that order, and the first
//! strategy that yields any record decides the result.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FetchError, Result};
use crate::keys::OwnerKey;
use crate::model::{parse_versioned, Manifest};
use crate::record::{newest, Filter, MANIFEST_KIND, TAG_CONTENT, TAG_IDENTIFIER};
use crate::source::RecordSource;

/// Tag names tried, in order, when locating a manifest.
const LOOKUP_TAGS: [&str; 2] = [TAG_CONTENT, TAG_IDENTIFIER];

/// Resolves the manifest of one file.
pub struct ManifestResolver {
    source: Arc<dyn RecordSource>,
    relays: Vec<String>,
}

impl ManifestResolver {
    /// Creates a resolver querying `relays`.
    pub fn new(source: Arc<dyn RecordSource>, relays: Vec<String>) -> Self {
        Self { source, relays }
    }

    /// Resolves the newest manifest for `content_hash` under `owner`.
    pub async fn resolve(&self, owner: &OwnerKey, content_hash: &str) -> Result<Manifest> {
        for tag in LOOKUP_TAGS {
            let filter = Filter::new()
                .author(owner.as_hex())
                .kind(MANIFEST_KIND)
                .tag(tag, content_hash);
            let records = self.source.query(&self.relays, &filter).await?;
            let count = records.len();
            let Some(record) = newest(records) else {
                debug!(owner = %owner, content_hash, tag, "no manifest under tag");
                continue;
            };

            let manifest: Manifest =
                parse_versioned(&record.content, &format!("manifest {}", content_hash))?;
            info!(
                owner = %owner,
                content_hash,
                tag,
                candidates = count,
                total_chunks = manifest.total_chunks,
                encryption = %manifest.encryption,
                "resolved manifest"
            );
            return Ok(manifest);
        }
        Err(FetchError::not_found(format!("manifest {}", content_hash)))
    }
}
