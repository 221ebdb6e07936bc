//! Published records and the filters used to select them.

use serde::{Deserialize, Serialize};

/// Record kind carrying a file listing page.
pub const INDEX_KIND: u32 = 30563;
/// Record kind carrying a per-file manifest.
pub const MANIFEST_KIND: u32 = 30564;
/// Record kind carrying one chunk of a file.
pub const CHUNK_KIND: u32 = 30565;

/// Identifier tag name (addressable record identifier).
pub const TAG_IDENTIFIER: &str = "d";
/// Content tag name (content hash of the file).
pub const TAG_CONTENT: &str = "x";
/// Explicit chunk index tag.
pub const TAG_INDEX: &str = "index";
/// Chunk encryption mode tag.
pub const TAG_ENCRYPTION: &str = "encryption";

/// A signed, author-addressed record as delivered by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque record id.
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Record kind.
    pub kind: u32,
    /// Tags as `[name, value, ...]` lists.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Payload.
    #[serde(default)]
    pub content: String,
}

impl Record {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Whether any tag `name` carries one of `values`.
    fn has_tag_in(&self, name: &str, values: &[String]) -> bool {
        self.tags.iter().any(|t| {
            t.first().map(String::as_str) == Some(name)
                && t.get(1).is_some_and(|v| values.iter().any(|x| x == v))
        })
    }
}

/// Selection criteria for `query` and `subscribe`. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Record ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    /// Author keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Record kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    /// Tag constraints as `(tag name, accepted values)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<(String, Vec<String>)>,
    /// Maximum number of stored records to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given author.
    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.push(pubkey.into());
        self
    }

    /// Restricts to the given kind.
    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restricts to the given record ids.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Requires tag `name` to carry `value`.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.tags.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.tags.push((name, vec![value])),
        }
        self
    }

    /// Caps the number of stored records returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` satisfies every constraint of this filter.
    pub fn matches(&self, record: &Record) -> bool {
        (self.ids.is_empty() || self.ids.contains(&record.id))
            && (self.authors.is_empty() || self.authors.contains(&record.pubkey))
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind))
            && self
                .tags
                .iter()
                .all(|(name, values)| record.has_tag_in(name, values))
    }
}

/// Picks the record with the greatest `created_at`; ties go to the last one seen.
pub fn newest(records: Vec<Record>) -> Option<Record> {
    records.into_iter().max_by_key(|r| r.created_at)
}
