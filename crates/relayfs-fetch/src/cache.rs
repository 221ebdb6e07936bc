//! Session-owned chunk cache.
//!
//! One entry per (owner key, content hash) accumulates chunk records across
//! collection runs. Each entry also carries the in-flight marker that lets
//! concurrent callers share a single collection, and a progress channel that
//! every waiting caller can observe.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::model::ChunkRecord;
use crate::record::{Record, TAG_ENCRYPTION, TAG_IDENTIFIER, TAG_INDEX};

/// Separator between the content hash and chunk index in identifier tags.
pub const ID_DELIMITER: char = ':';

/// Cache key: one file under one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Owner key (hex).
    pub owner: String,
    /// Content hash of the file.
    pub content_hash: String,
}

impl CacheKey {
    /// Creates a key.
    pub fn new(owner: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// Outcome of one collection run, published to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectStatus {
    /// Still collecting.
    Running,
    /// Collection ended; the cache holds whatever was found.
    Finished,
    /// Collection could not run.
    Failed(String),
}

impl CollectStatus {
    /// Whether the run has ended, successfully or not.
    pub fn is_done(&self) -> bool {
        !matches!(self, CollectStatus::Running)
    }
}

/// What happened to one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Record id was already seen.
    Duplicate,
    /// No chunk index could be parsed.
    Unparsable,
    /// Index is not below `total_chunks`.
    OutOfRange,
    /// Another record already supplied this index.
    AlreadyHave,
    /// New distinct chunk; carries the distinct count after insertion.
    Inserted(usize),
}

/// Extracts the chunk index of a record.
///
/// The explicit index tag wins; otherwise the trailing numeric segment of the
/// identifier tag (`{hash}:{index}`) is used.
pub fn parse_chunk_index(record: &Record) -> Option<u32> {
    if let Some(index) = record
        .tag_value(TAG_INDEX)
        .and_then(|v| v.trim().parse().ok())
    {
        return Some(index);
    }
    record
        .tag_value(TAG_IDENTIFIER)?
        .rsplit(ID_DELIMITER)
        .next()?
        .trim()
        .parse()
        .ok()
}

#[derive(Default)]
struct EntryState {
    chunks: BTreeMap<u32, ChunkRecord>,
    seen_ids: HashSet<String>,
    in_flight: Option<watch::Receiver<CollectStatus>>,
}

/// Cached chunks of one file.
pub struct CacheEntry {
    state: Mutex<EntryState>,
    progress: watch::Sender<usize>,
    last_used: AtomicU64,
}

pub(crate) enum Claim {
    /// Cache already holds every chunk.
    Complete(Vec<ChunkRecord>),
    /// Another caller is collecting; wait on its status.
    Wait(watch::Receiver<CollectStatus>),
    /// Caller became the collector.
    Lead(InFlight, watch::Receiver<CollectStatus>),
}

impl CacheEntry {
    fn new(tick: u64) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            state: Mutex::new(EntryState::default()),
            progress,
            last_used: AtomicU64::new(tick),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deduplicates, parses and stores one record.
    pub fn ingest(&self, record: &Record, total_chunks: u32) -> Ingest {
        let mut state = self.lock();
        if !state.seen_ids.insert(record.id.clone()) {
            return Ingest::Duplicate;
        }
        let Some(index) = parse_chunk_index(record) else {
            return Ingest::Unparsable;
        };
        if index >= total_chunks {
            return Ingest::OutOfRange;
        }
        if state.chunks.contains_key(&index) {
            return Ingest::AlreadyHave;
        }
        state.chunks.insert(
            index,
            ChunkRecord {
                index,
                record_id: record.id.clone(),
                content: record.content.clone(),
                encryption: record
                    .tag_value(TAG_ENCRYPTION)
                    .unwrap_or("none")
                    .to_string(),
            },
        );
        let count = state.chunks.len();
        drop(state);
        self.progress.send_replace(count);
        Ingest::Inserted(count)
    }

    /// Number of distinct chunk indices held.
    pub fn distinct(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Chunks sorted ascending by index.
    pub fn snapshot(&self) -> Vec<ChunkRecord> {
        self.lock().chunks.values().cloned().collect()
    }

    /// Indices below `total_chunks` not yet held.
    pub fn missing(&self, total_chunks: u32) -> Vec<u32> {
        let state = self.lock();
        (0..total_chunks)
            .filter(|i| !state.chunks.contains_key(i))
            .collect()
    }

    /// Whether a collection is currently running for this file.
    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// Subscribes to the distinct-count progress channel.
    pub fn progress(&self) -> watch::Receiver<usize> {
        self.progress.subscribe()
    }

    /// Atomically checks completeness and the in-flight marker, claiming the
    /// collector role when nobody holds it.
    pub(crate) fn claim(self: &Arc<Self>, total_chunks: u32) -> Claim {
        let mut state = self.lock();
        if state.chunks.len() >= total_chunks as usize {
            return Claim::Complete(state.chunks.values().cloned().collect());
        }
        if let Some(rx) = &state.in_flight {
            return Claim::Wait(rx.clone());
        }
        let (tx, rx) = watch::channel(CollectStatus::Running);
        state.in_flight = Some(rx.clone());
        Claim::Lead(
            InFlight {
                entry: Arc::clone(self),
                tx: Some(tx),
            },
            rx,
        )
    }

    fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Relaxed);
    }
}

/// In-flight marker held by the collector. Released on `finish` or drop.
pub(crate) struct InFlight {
    entry: Arc<CacheEntry>,
    tx: Option<watch::Sender<CollectStatus>>,
}

impl InFlight {
    /// Entry being filled.
    pub(crate) fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Clears the marker and wakes every waiter with `status`.
    pub(crate) fn finish(mut self, status: CollectStatus) {
        self.release(status);
    }

    fn release(&mut self, status: CollectStatus) {
        if let Some(tx) = self.tx.take() {
            self.entry.lock().in_flight = None;
            tx.send_replace(status);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.release(CollectStatus::Failed("collection aborted".to_string()));
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Files with an entry.
    pub files: usize,
    /// Chunks held across all files.
    pub chunks: usize,
    /// Files with a collection running.
    pub in_flight: usize,
}

/// Chunk cache owned by a fetch session.
pub struct ChunkCache {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    max_files: Option<usize>,
    clock: AtomicU64,
}

impl ChunkCache {
    /// Creates a cache; `max_files` bounds the number of idle files kept.
    pub fn new(max_files: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            max_files,
            clock: AtomicU64::new(0),
        }
    }

    /// Entry for `key`, created on first use.
    pub fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.entries.get(key) {
            entry.touch(tick);
            return Arc::clone(&entry);
        }
        let entry = Arc::clone(
            self.entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheEntry::new(tick)))
                .value(),
        );
        entry.touch(tick);
        self.enforce_bound(key);
        entry
    }

    /// Creates or touches the entry for `key` and claims it in one step.
    ///
    /// The map slot stays locked until the claim is made, so the bound can
    /// never evict an entry between lookup and claim.
    pub(crate) fn claim(&self, key: &CacheKey, total_chunks: u32) -> (Arc<CacheEntry>, Claim) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let (entry, claim) = {
            let slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheEntry::new(tick)));
            let entry = Arc::clone(slot.value());
            entry.touch(tick);
            let claim = entry.claim(total_chunks);
            (entry, claim)
        };
        self.enforce_bound(key);
        (entry, claim)
    }

    /// Existing entry for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Drops the chunks of one file. Entries with a running collection are kept.
    pub fn evict(&self, key: &CacheKey) -> bool {
        self.entries
            .remove_if(key, |_, entry| !entry.is_in_flight())
            .is_some()
    }

    /// Drops every idle entry.
    pub fn clear(&self) {
        self.entries.retain(|_, entry| entry.is_in_flight());
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            stats.files += 1;
            stats.chunks += entry.distinct();
            if entry.is_in_flight() {
                stats.in_flight += 1;
            }
        }
        stats
    }

    fn enforce_bound(&self, keep: &CacheKey) {
        let Some(max) = self.max_files else {
            return;
        };
        while self.entries.len() > max {
            let victim = self
                .entries
                .iter()
                .filter(|e| e.key() != keep && !e.is_in_flight())
                .min_by_key(|e| e.last_used.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            let Some(victim) = victim else {
                return;
            };
            debug!(owner = %victim.owner, content_hash = %victim.content_hash, "evicting cached file");
            self.entries.remove(&victim);
        }
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(None)
    }
}
