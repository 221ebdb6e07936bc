//! Shared fixtures: a publisher that turns files into the records a relay set
//! would hold.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use relayfs_fetch::cipher;
use relayfs_fetch::index::{archive_index_id, CURRENT_INDEX_ID};
use relayfs_fetch::record::{
    CHUNK_KIND, INDEX_KIND, MANIFEST_KIND, TAG_CONTENT, TAG_ENCRYPTION, TAG_IDENTIFIER, TAG_INDEX,
};
use relayfs_fetch::{
    ChunkInfo, ConversationKey, EncryptionMode, FileEntry, FileIndexPage, Manifest, OwnerKey,
    Record, SecretKey,
};
use sha2::{Digest, Sha256};

pub const CHUNK_SIZE: usize = 8;

/// Publishes files for one owner.
pub struct Publisher {
    pub secret: SecretKey,
    pub owner: OwnerKey,
    clock: u64,
    next_id: u64,
}

/// Everything published for one file.
pub struct PublishedFile {
    pub manifest: Manifest,
    pub manifest_record: Record,
    pub chunks: Vec<Record>,
}

impl PublishedFile {
    pub fn hash(&self) -> &str {
        &self.manifest.file_hash
    }

    /// Manifest plus every chunk.
    pub fn records(&self) -> Vec<Record> {
        let mut all = vec![self.manifest_record.clone()];
        all.extend(self.chunks.iter().cloned());
        all
    }
}

impl Publisher {
    pub fn new(secret_hex: &str) -> Self {
        let secret = SecretKey::parse(secret_hex).unwrap();
        let owner = secret.owner_key().unwrap();
        Self {
            secret,
            owner,
            clock: 1_700_000_000,
            next_id: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn record(&mut self, prefix: &str, kind: u32, tags: Vec<Vec<String>>, content: String) -> Record {
        Record {
            id: self.id(prefix),
            pubkey: self.owner.as_hex().to_string(),
            created_at: self.tick(),
            kind,
            tags,
            content,
        }
    }

    /// Splits `data` into chunks and publishes a manifest for them.
    pub fn publish(&mut self, name: &str, data: &[u8], mode: EncryptionMode) -> PublishedFile {
        let file_hash = hex::encode(Sha256::digest(data));
        let key = ConversationKey::derive(&self.secret, &self.owner).unwrap();

        let mut chunks = Vec::new();
        let mut infos = Vec::new();
        for (i, part) in data.chunks(CHUNK_SIZE).enumerate() {
            let content = match mode {
                EncryptionMode::None => STANDARD.encode(part),
                EncryptionMode::Sealed => cipher::encrypt(part, &key).unwrap(),
            };
            let tags = vec![
                vec![TAG_IDENTIFIER.to_string(), format!("{}:{}", file_hash, i)],
                vec![TAG_CONTENT.to_string(), file_hash.clone()],
                vec![TAG_INDEX.to_string(), i.to_string()],
                vec![TAG_ENCRYPTION.to_string(), mode.as_str().to_string()],
            ];
            let record = self.record("chunk", CHUNK_KIND, tags, content);
            infos.push(ChunkInfo {
                index: i as u32,
                record_id: record.id.clone(),
                hash: Some(hex::encode(Sha256::digest(part))),
            });
            chunks.push(record);
        }

        let manifest = Manifest {
            version: 2,
            file_name: name.to_string(),
            file_hash: file_hash.clone(),
            file_size: data.len() as u64,
            chunk_size: CHUNK_SIZE as u64,
            total_chunks: chunks.len() as u32,
            created_at: self.clock,
            owner: self.owner.as_hex().to_string(),
            encryption: mode,
            chunks: infos,
            relays: vec![],
            mime_type: Some("application/octet-stream".to_string()),
        };
        let manifest_record = self.manifest_record(&manifest);
        PublishedFile {
            manifest,
            manifest_record,
            chunks,
        }
    }

    /// Manifest record for `manifest`, tagged by content hash.
    pub fn manifest_record(&mut self, manifest: &Manifest) -> Record {
        let tags = vec![vec![TAG_CONTENT.to_string(), manifest.file_hash.clone()]];
        self.record(
            "manifest",
            MANIFEST_KIND,
            tags,
            serde_json::to_string(manifest).unwrap(),
        )
    }

    /// Listing page record; `archive == 0` is the current page.
    pub fn index_page(&mut self, files: &[&PublishedFile], archive: u32, total_archives: u32) -> Record {
        let page = FileIndexPage {
            version: 2,
            files: files
                .iter()
                .map(|f| FileEntry {
                    hash: f.manifest.file_hash.clone(),
                    name: f.manifest.file_name.clone(),
                    size: f.manifest.file_size,
                    uploaded_at: f.manifest.created_at,
                    encryption: f.manifest.encryption,
                })
                .collect(),
            archive,
            total_archives,
        };
        let identifier = if archive == 0 {
            CURRENT_INDEX_ID.to_string()
        } else {
            archive_index_id(archive)
        };
        self.record(
            "index",
            INDEX_KIND,
            vec![vec![TAG_IDENTIFIER.to_string(), identifier]],
            serde_json::to_string(&page).unwrap(),
        )
    }
}

/// Deterministic test data of `len` bytes.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
