//! Fetch session: the entry point tying resolution, collection and assembly
//! together over one record source and one chunk cache.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assembler::Assembler;
use crate::cache::{CacheKey, CacheStats, ChunkCache};
use crate::cipher::ConversationKey;
use crate::collector::{ChunkCollector, CollectRequest, CollectorSettings, Progress};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::index::IndexResolver;
use crate::keys::{OwnerKey, SecretKey};
use crate::manifest::ManifestResolver;
use crate::model::{EncryptionMode, FileEntry, FileIndexPage, Manifest};
use crate::source::RecordSource;

/// A fully assembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// File name from the manifest.
    pub name: String,
    /// MIME type from the manifest, if recorded.
    pub mime_type: Option<String>,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Retrieval session over one record source.
///
/// The chunk cache lives as long as the session; concurrent downloads of the
/// same file share one collection.
pub struct FetchSession {
    config: FetchConfig,
    cache: Arc<ChunkCache>,
    indexes: IndexResolver,
    manifests: ManifestResolver,
    collector: ChunkCollector,
}

impl FetchSession {
    /// Creates a session. Fails on an invalid configuration.
    pub fn new(source: Arc<dyn RecordSource>, config: FetchConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ChunkCache::new(config.max_cached_files));
        let relays = config.default_relays.clone();
        Ok(Self {
            indexes: IndexResolver::new(Arc::clone(&source), relays.clone()),
            manifests: ManifestResolver::new(Arc::clone(&source), relays),
            collector: ChunkCollector::new(
                source,
                Arc::clone(&cache),
                CollectorSettings::from(&config),
            ),
            cache,
            config,
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// One listing page (1-based) of `owner`'s files.
    pub async fn list_files(&self, owner: &OwnerKey, page: u32) -> Result<FileIndexPage> {
        self.indexes.resolve(owner, page).await
    }

    /// Every file listed on the current page and all archives.
    pub async fn list_all_files(&self, owner: &OwnerKey) -> Result<Vec<FileEntry>> {
        self.indexes.resolve_all(owner).await
    }

    /// Manifest of one file.
    pub async fn manifest(&self, owner: &OwnerKey, content_hash: &str) -> Result<Manifest> {
        self.manifests.resolve(owner, content_hash).await
    }

    /// Downloads and assembles one file.
    ///
    /// `secret` is required for sealed files. `on_progress` sees distinct
    /// chunk counts as they arrive. Cancelling `cancel` returns
    /// [`FetchError::Cancelled`] without stopping a collection other callers
    /// are waiting on.
    pub async fn download(
        &self,
        owner: &OwnerKey,
        content_hash: &str,
        secret: Option<&SecretKey>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile> {
        let manifest = cancellable(cancel, self.manifest(owner, content_hash)).await?;
        self.fetch_file(owner, content_hash, &manifest, secret, on_progress, cancel)
            .await
    }

    /// Like [`download`](Self::download), but refuses files larger than
    /// `preview_max_bytes` before any chunk is requested.
    pub async fn preview(
        &self,
        owner: &OwnerKey,
        content_hash: &str,
        secret: Option<&SecretKey>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile> {
        let manifest = cancellable(cancel, self.manifest(owner, content_hash)).await?;
        if manifest.file_size > self.config.preview_max_bytes {
            return Err(FetchError::PreviewTooLarge {
                size: manifest.file_size,
                limit: self.config.preview_max_bytes,
            });
        }
        self.fetch_file(owner, content_hash, &manifest, secret, on_progress, cancel)
            .await
    }

    async fn fetch_file(
        &self,
        owner: &OwnerKey,
        content_hash: &str,
        manifest: &Manifest,
        secret: Option<&SecretKey>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile> {
        let key = match manifest.encryption {
            EncryptionMode::Sealed => {
                let secret = secret.ok_or(FetchError::MissingKey)?;
                Some(ConversationKey::derive(secret, owner)?)
            }
            EncryptionMode::None => None,
        };

        let mut request =
            CollectRequest::from_manifest(owner.clone(), manifest, &self.config.default_relays);
        request.content_hash = content_hash.to_string();

        let chunks = self.collector.collect(&request, on_progress, cancel).await?;

        let mut assembler = Assembler::for_manifest(manifest);
        if let Some(key) = key.as_ref() {
            assembler = assembler.with_key(key);
        }
        if self.config.verify_integrity {
            assembler = assembler.verify_against(manifest);
        }
        let bytes = assembler.assemble(&chunks).inspect_err(|e| {
            warn!(owner = %owner, content_hash, error = %e, "assembly failed");
        })?;

        info!(
            owner = %owner,
            content_hash,
            name = %manifest.file_name,
            bytes = bytes.len(),
            "download complete"
        );
        Ok(DownloadedFile {
            name: manifest.file_name.clone(),
            mime_type: manifest.mime_type.clone(),
            bytes,
        })
    }

    /// Drops cached chunks of one file. Returns whether anything was removed.
    pub fn evict(&self, owner: &OwnerKey, content_hash: &str) -> bool {
        self.cache
            .evict(&CacheKey::new(owner.as_hex(), content_hash))
    }

    /// Drops every cached file without a running collection.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Chunk cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use crate::model::ChunkInfo;
    use crate::record::{Record, CHUNK_KIND, MANIFEST_KIND, TAG_CONTENT, TAG_INDEX};
    use crate::source::MemorySource;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use sha2::{Digest, Sha256};

    const SECRET: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    fn owner() -> OwnerKey {
        SecretKey::parse(SECRET).unwrap().owner_key().unwrap()
    }

    fn manifest(data: &[u8], total_chunks: u32, encryption: EncryptionMode) -> Manifest {
        Manifest {
            version: 2,
            file_name: "notes.txt".into(),
            file_hash: hex::encode(Sha256::digest(data)),
            file_size: data.len() as u64,
            chunk_size: 4,
            total_chunks,
            created_at: 1,
            owner: owner().as_hex().to_string(),
            encryption,
            chunks: vec![],
            relays: vec![],
            mime_type: Some("text/plain".into()),
        }
    }

    fn manifest_record(m: &Manifest) -> Record {
        Record {
            id: "m".into(),
            pubkey: owner().as_hex().to_string(),
            created_at: 1,
            kind: MANIFEST_KIND,
            tags: vec![vec![TAG_CONTENT.into(), m.file_hash.clone()]],
            content: serde_json::to_string(m).unwrap(),
        }
    }

    fn chunk_record(hash: &str, index: u32, content: String) -> Record {
        Record {
            id: format!("c{}", index),
            pubkey: owner().as_hex().to_string(),
            created_at: 1,
            kind: CHUNK_KIND,
            tags: vec![
                vec![TAG_CONTENT.into(), hash.to_string()],
                vec![TAG_INDEX.into(), index.to_string()],
            ],
            content,
        }
    }

    fn plain_file(data: &[u8]) -> (Manifest, Vec<Record>) {
        let parts: Vec<&[u8]> = data.chunks(4).collect();
        let m = manifest(data, parts.len() as u32, EncryptionMode::None);
        let mut records = vec![manifest_record(&m)];
        for (i, part) in parts.iter().enumerate() {
            records.push(chunk_record(&m.file_hash, i as u32, STANDARD.encode(part)));
        }
        (m, records)
    }

    fn session(source: MemorySource, config: FetchConfig) -> FetchSession {
        FetchSession::new(Arc::new(source), config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_plain_file() {
        let (m, records) = plain_file(b"hello relay world");
        let session = session(MemorySource::with_records(records), FetchConfig::default());
        let file = session
            .download(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.bytes, b"hello relay world");
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(session.cache_stats().files, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_sealed_file() {
        let secret = SecretKey::parse(SECRET).unwrap();
        let key = ConversationKey::derive(&secret, &owner()).unwrap();
        let data = b"sealed contents";
        let m = manifest(data, 2, EncryptionMode::Sealed);
        let source = MemorySource::with_records(vec![
            manifest_record(&m),
            chunk_record(&m.file_hash, 0, cipher::encrypt(&data[..8], &key).unwrap()),
            chunk_record(&m.file_hash, 1, cipher::encrypt(&data[8..], &key).unwrap()),
        ]);
        let session = session(source, FetchConfig::default());
        let file = session
            .download(&owner(), &m.file_hash, Some(&secret), &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.bytes, data);
    }

    #[tokio::test(start_paused = true)]
    async fn sealed_file_without_secret_fails_before_collecting() {
        let m = manifest(b"x", 1, EncryptionMode::Sealed);
        let source = Arc::new(MemorySource::with_records(vec![manifest_record(&m)]));
        let session = FetchSession::new(source.clone(), FetchConfig::default()).unwrap();
        let err = session
            .download(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingKey));
        assert_eq!(source.subscriptions_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preview_refuses_large_files() {
        let (m, records) = plain_file(b"0123456789");
        let config = FetchConfig {
            preview_max_bytes: 4,
            ..FetchConfig::default()
        };
        let session = session(MemorySource::with_records(records), config);
        let err = session
            .preview(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::PreviewTooLarge { size: 10, limit: 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn tampered_chunk_fails_integrity_check() {
        let (m, mut records) = plain_file(b"abcdefgh");
        records[2].content = STANDARD.encode(b"eXgh");
        let config = FetchConfig {
            verify_integrity: true,
            ..FetchConfig::default()
        };
        let session = session(MemorySource::with_records(records), config);
        let err = session
            .download(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::IntegrityMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn opaque_content_hash_downloads_by_default() {
        let mut m = manifest(b"abcdef", 2, EncryptionMode::None);
        m.file_hash = "file-42".to_string();
        let source = MemorySource::with_records(vec![
            manifest_record(&m),
            chunk_record("file-42", 0, STANDARD.encode(b"abcd")),
            chunk_record("file-42", 1, STANDARD.encode(b"ef")),
        ]);
        let session = session(source, FetchConfig::default());
        let file = session
            .download(&owner(), "file-42", None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.bytes, b"abcdef");
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_hashes_over_stored_payloads_download_by_default() {
        let secret = SecretKey::parse(SECRET).unwrap();
        let key = ConversationKey::derive(&secret, &owner()).unwrap();
        let payload = cipher::encrypt(b"sealed", &key).unwrap();
        let mut m = manifest(b"sealed", 1, EncryptionMode::Sealed);
        m.chunks = vec![ChunkInfo {
            index: 0,
            record_id: "c0".into(),
            hash: Some(hex::encode(Sha256::digest(payload.as_bytes()))),
        }];
        let source = MemorySource::with_records(vec![
            manifest_record(&m),
            chunk_record(&m.file_hash, 0, payload),
        ]);
        let session = session(source, FetchConfig::default());
        let file = session
            .download(&owner(), &m.file_hash, Some(&secret), &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.bytes, b"sealed");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_download_returns_cancelled() {
        let (m, records) = plain_file(b"abcd");
        let session = session(MemorySource::with_records(records), FetchConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session
            .download(&owner(), &m.file_hash, None, &|_| {}, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn evict_and_clear_drop_cached_files() {
        let (m, records) = plain_file(b"abcdefgh");
        let session = session(MemorySource::with_records(records), FetchConfig::default());
        session
            .download(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.cache_stats().chunks, 2);
        assert!(session.evict(&owner(), &m.file_hash));
        assert!(!session.evict(&owner(), &m.file_hash));
        assert_eq!(session.cache_stats(), CacheStats::default());

        session
            .download(&owner(), &m.file_hash, None, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        session.clear_cache();
        assert_eq!(session.cache_stats().files, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = FetchConfig {
            id_batch_size: 0,
            ..FetchConfig::default()
        };
        assert!(matches!(
            FetchSession::new(Arc::new(MemorySource::new()), config),
            Err(FetchError::Config(_))
        ));
    }
}
