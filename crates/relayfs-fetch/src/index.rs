//! File index resolution.
//!
//! Page 1 is the current listing, published under a fixed identifier. Older
//! listings are numbered archives; page `N > 1` maps to archive
//! `total_archives + 2 - N`, so page 2 is the most recent archive.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FetchError, Result};
use crate::keys::OwnerKey;
use crate::model::{parse_versioned, FileEntry, FileIndexPage};
use crate::record::{newest, Filter, INDEX_KIND, TAG_IDENTIFIER};
use crate::source::RecordSource;

/// Identifier of the current listing.
pub const CURRENT_INDEX_ID: &str = "relayfs-index";

/// Identifier of archive number `n`.
pub fn archive_index_id(n: u32) -> String {
    format!("{}-archive-{}", CURRENT_INDEX_ID, n)
}

/// Archive number holding `page`, given the archive count from page 1.
///
/// Returns `None` for page 1 and for pages past the last archive.
pub fn archive_number(page: u32, total_archives: u32) -> Option<u32> {
    if page < 2 || page > total_archives + 1 {
        return None;
    }
    Some(total_archives + 2 - page)
}

/// Resolves listing pages for an owner.
pub struct IndexResolver {
    source: Arc<dyn RecordSource>,
    relays: Vec<String>,
}

impl IndexResolver {
    /// Creates a resolver querying `relays`.
    pub fn new(source: Arc<dyn RecordSource>, relays: Vec<String>) -> Self {
        Self { source, relays }
    }

    /// Resolves `page` (1-based). Pages past 1 cost an extra page-1 lookup.
    pub async fn resolve(&self, owner: &OwnerKey, page: u32) -> Result<FileIndexPage> {
        match page {
            0 => Err(FetchError::not_found("index page 0")),
            1 => self.fetch(owner, CURRENT_INDEX_ID).await,
            _ => {
                let current = self.fetch(owner, CURRENT_INDEX_ID).await?;
                self.resolve_archive(owner, page, current.total_archives)
                    .await
            }
        }
    }

    /// Resolves archive page `page` when `total_archives` is already known.
    pub async fn resolve_archive(
        &self,
        owner: &OwnerKey,
        page: u32,
        total_archives: u32,
    ) -> Result<FileIndexPage> {
        let n = archive_number(page, total_archives).ok_or_else(|| {
            FetchError::not_found(format!(
                "index page {} (of {})",
                page,
                total_archives + 1
            ))
        })?;
        self.fetch(owner, &archive_index_id(n)).await
    }

    /// Walks the current page and every archive, resolving page 1 only once.
    ///
    /// Archive pages that cannot be located are skipped; a version mismatch
    /// on any page is still fatal.
    pub async fn resolve_all(&self, owner: &OwnerKey) -> Result<Vec<FileEntry>> {
        let current = self.fetch(owner, CURRENT_INDEX_ID).await?;
        let total = current.total_archives;
        let mut files = current.files;
        for page in 2..=total + 1 {
            match self.resolve_archive(owner, page, total).await {
                Ok(archive) => files.extend(archive.files),
                Err(FetchError::NotFound { what }) => {
                    debug!(owner = %owner, what = %what, "archive page missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }

    async fn fetch(&self, owner: &OwnerKey, identifier: &str) -> Result<FileIndexPage> {
        let filter = Filter::new()
            .author(owner.as_hex())
            .kind(INDEX_KIND)
            .tag(TAG_IDENTIFIER, identifier);
        let records = self.source.query(&self.relays, &filter).await?;
        let count = records.len();
        let record = newest(records)
            .ok_or_else(|| FetchError::not_found(format!("index {}", identifier)))?;
        let page: FileIndexPage =
            parse_versioned(&record.content, &format!("index {}", identifier))?;
        info!(
            owner = %owner,
            identifier,
            candidates = count,
            files = page.files.len(),
            total_archives = page.total_archives,
            "resolved index page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::source::MemorySource;

    const OWNER: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn owner() -> OwnerKey {
        OwnerKey::parse(OWNER).unwrap()
    }

    fn index_record(id: &str, identifier: &str, created_at: u64, content: String) -> Record {
        Record {
            id: id.to_string(),
            pubkey: OWNER.to_string(),
            created_at,
            kind: INDEX_KIND,
            tags: vec![vec![TAG_IDENTIFIER.to_string(), identifier.to_string()]],
            content,
        }
    }

    fn page_json(names: &[&str], archive: u32, total_archives: u32) -> String {
        let files: Vec<FileEntry> = names
            .iter()
            .map(|n| FileEntry {
                hash: format!("hash-{}", n),
                name: n.to_string(),
                size: 1,
                uploaded_at: 0,
                encryption: Default::default(),
            })
            .collect();
        serde_json::to_string(&FileIndexPage {
            version: 2,
            files,
            archive,
            total_archives,
        })
        .unwrap()
    }

    fn resolver(source: MemorySource) -> IndexResolver {
        IndexResolver::new(Arc::new(source), vec!["wss://r1".to_string()])
    }

    #[test]
    fn archive_numbering() {
        assert_eq!(archive_number(1, 3), None);
        assert_eq!(archive_number(2, 3), Some(3));
        assert_eq!(archive_number(4, 3), Some(1));
        assert_eq!(archive_number(5, 3), None);
        assert_eq!(archive_number(2, 0), None);
    }

    #[tokio::test]
    async fn newest_record_wins() {
        let source = MemorySource::with_records(vec![
            index_record("old", CURRENT_INDEX_ID, 100, page_json(&["old"], 0, 0)),
            index_record("new", CURRENT_INDEX_ID, 200, page_json(&["new"], 0, 0)),
        ]);
        let page = resolver(source).resolve(&owner(), 1).await.unwrap();
        assert_eq!(page.files[0].name, "new");
    }

    #[tokio::test]
    async fn archive_page_maps_to_archive_number() {
        let source = MemorySource::with_records(vec![
            index_record("c", CURRENT_INDEX_ID, 300, page_json(&["current"], 0, 2)),
            index_record("a2", &archive_index_id(2), 200, page_json(&["second"], 2, 2)),
            index_record("a1", &archive_index_id(1), 100, page_json(&["first"], 1, 2)),
        ]);
        let resolver = resolver(source);
        assert_eq!(resolver.resolve(&owner(), 2).await.unwrap().files[0].name, "second");
        assert_eq!(resolver.resolve(&owner(), 3).await.unwrap().files[0].name, "first");
        assert!(matches!(
            resolver.resolve(&owner(), 4).await,
            Err(FetchError::NotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve(&owner(), 0).await,
            Err(FetchError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolve_all_reuses_page_one() {
        let source = Arc::new(MemorySource::with_records(vec![
            index_record("c", CURRENT_INDEX_ID, 300, page_json(&["current"], 0, 2)),
            index_record("a2", &archive_index_id(2), 200, page_json(&["second"], 2, 2)),
            index_record("a1", &archive_index_id(1), 100, page_json(&["first"], 1, 2)),
        ]));
        let resolver = IndexResolver::new(source.clone(), vec!["wss://r1".to_string()]);
        let files = resolver.resolve_all(&owner()).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["current", "second", "first"]);
        assert_eq!(source.queries_issued(), 3);
    }

    #[tokio::test]
    async fn missing_index_is_not_found() {
        let err = resolver(MemorySource::new()).resolve(&owner(), 1).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unparsable_index_is_not_found() {
        let source = MemorySource::with_records(vec![index_record(
            "c",
            CURRENT_INDEX_ID,
            1,
            "{broken".to_string(),
        )]);
        let err = resolver(source).resolve(&owner(), 1).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn wrong_version_is_fatal() {
        let source = MemorySource::with_records(vec![index_record(
            "c",
            CURRENT_INDEX_ID,
            1,
            r#"{"version": 3, "files": []}"#.to_string(),
        )]);
        let err = resolver(source).resolve(&owner(), 1).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::UnsupportedVersion { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn records_of_other_owners_are_ignored() {
        let mut foreign = index_record("f", CURRENT_INDEX_ID, 500, page_json(&["foreign"], 0, 0));
        foreign.pubkey = "someone-else".to_string();
        let source = MemorySource::with_records(vec![
            foreign,
            index_record("c", CURRENT_INDEX_ID, 100, page_json(&["mine"], 0, 0)),
        ]);
        let page = resolver(source).resolve(&owner(), 1).await.unwrap();
        assert_eq!(page.files[0].name, "mine");
    }
}
