//! Chunk collection from unreliable relays.
//!
//! A collection run opens one live subscription for the file's chunk records
//! and ingests whatever arrives, in any order and with duplicates, until the
//! distinct count reaches `total_chunks`, the relays go quiet for the
//! inactivity window, or the absolute ceiling passes. Missing chunks with a
//! record id hint are then looked up directly by id, in batches.
//!
//! Runs execute on their own task. Callers for the same file join the running
//! collection instead of starting another one, and a caller that cancels only
//! detaches itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, ChunkCache, Claim, CollectStatus, InFlight, Ingest};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::keys::OwnerKey;
use crate::model::{ChunkInfo, ChunkRecord, Manifest};
use crate::record::{Filter, CHUNK_KIND, TAG_CONTENT};
use crate::source::{RecordSource, Subscription, SubscriptionEvent};

/// Distinct chunks held versus chunks expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Distinct chunk indices collected so far.
    pub received: usize,
    /// `total_chunks` from the manifest.
    pub total: usize,
}

/// Timing and batching knobs of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Interval of completion checks.
    pub poll_interval: Duration,
    /// Stop after this long without a new distinct chunk.
    pub inactivity_timeout: Duration,
    /// Absolute ceiling per run.
    pub max_wait: Duration,
    /// Record ids per fallback query.
    pub id_batch_size: usize,
}

impl From<&FetchConfig> for CollectorSettings {
    fn from(config: &FetchConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            inactivity_timeout: config.inactivity_timeout(),
            max_wait: config.max_wait(),
            id_batch_size: config.id_batch_size.max(1),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

/// Which file to collect and where to look.
#[derive(Debug, Clone)]
pub struct CollectRequest {
    /// Owner of the file.
    pub owner: OwnerKey,
    /// Content hash of the file.
    pub content_hash: String,
    /// Authoritative chunk count.
    pub total_chunks: u32,
    /// Index → record id hints for the fallback pass.
    pub hints: Vec<ChunkInfo>,
    /// Relays to subscribe and query on.
    pub relays: Vec<String>,
}

impl CollectRequest {
    /// Builds a request from a manifest, using `default_relays` when the
    /// manifest names none.
    pub fn from_manifest(owner: OwnerKey, manifest: &Manifest, default_relays: &[String]) -> Self {
        let relays = if manifest.relays.is_empty() {
            default_relays.to_vec()
        } else {
            manifest.relays.clone()
        };
        Self {
            owner,
            content_hash: manifest.file_hash.clone(),
            total_chunks: manifest.total_chunks,
            hints: manifest.chunks.clone(),
            relays,
        }
    }
}

/// Why a subscription was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Complete,
    Inactive,
    Ceiling,
    StreamEnded,
}

/// Collects chunk records into the session cache.
pub struct ChunkCollector {
    source: Arc<dyn RecordSource>,
    cache: Arc<ChunkCache>,
    settings: CollectorSettings,
}

impl ChunkCollector {
    /// Creates a collector filling `cache` from `source`.
    pub fn new(
        source: Arc<dyn RecordSource>,
        cache: Arc<ChunkCache>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    /// Collects the chunks of one file.
    ///
    /// Returns at most one record per index, sorted by index. The result may
    /// be short of `total_chunks`; checking that is up to the caller.
    pub async fn collect(
        &self,
        request: &CollectRequest,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkRecord>> {
        let key = CacheKey::new(request.owner.as_hex(), request.content_hash.as_str());
        let total = request.total_chunks;
        let mut joined_incomplete = false;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let (entry, claim) = self.cache.claim(&key, total);
            let (mut status_rx, leading) = match claim {
                Claim::Complete(chunks) => {
                    debug!(
                        owner = %request.owner,
                        content_hash = %request.content_hash,
                        chunks = chunks.len(),
                        "chunk cache hit"
                    );
                    return Ok(chunks);
                }
                Claim::Wait(rx) => {
                    debug!(
                        owner = %request.owner,
                        content_hash = %request.content_hash,
                        "joining in-flight collection"
                    );
                    (rx, false)
                }
                Claim::Lead(flight, rx) => {
                    self.spawn_run(flight, request.clone());
                    (rx, true)
                }
            };

            let status = wait_for_run(&mut status_rx, &entry, total, on_progress, cancel).await?;
            let complete = entry.distinct() >= total as usize;

            if complete || leading || joined_incomplete {
                if let (false, CollectStatus::Failed(msg)) = (complete, &status) {
                    return Err(FetchError::source(msg.clone()));
                }
                return Ok(entry.snapshot());
            }
            // the run we joined ended short; try once more ourselves
            joined_incomplete = true;
        }
    }

    fn spawn_run(&self, flight: InFlight, request: CollectRequest) {
        let source = Arc::clone(&self.source);
        let settings = self.settings;
        tokio::spawn(async move {
            let status = run_collection(source.as_ref(), flight.entry(), &request, settings).await;
            flight.finish(status);
        });
    }
}

async fn wait_for_run(
    status_rx: &mut watch::Receiver<CollectStatus>,
    entry: &CacheEntry,
    total: u32,
    on_progress: &(dyn Fn(Progress) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<CollectStatus> {
    let total = total as usize;
    let mut progress_rx = entry.progress();
    let initial = *progress_rx.borrow_and_update();
    if initial > 0 {
        on_progress(Progress {
            received: initial,
            total,
        });
    }

    loop {
        let status = status_rx.borrow_and_update().clone();
        if status.is_done() {
            if progress_rx.has_changed().unwrap_or(false) {
                let received = *progress_rx.borrow_and_update();
                on_progress(Progress { received, total });
            }
            return Ok(status);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    let status = status_rx.borrow().clone();
                    return Ok(if status.is_done() {
                        status
                    } else {
                        CollectStatus::Failed("collector went away".to_string())
                    });
                }
            }
            Ok(()) = progress_rx.changed() => {
                let received = *progress_rx.borrow_and_update();
                on_progress(Progress { received, total });
            }
        }
    }
}

async fn run_collection(
    source: &dyn RecordSource,
    entry: &CacheEntry,
    request: &CollectRequest,
    settings: CollectorSettings,
) -> CollectStatus {
    let started = Instant::now();
    let total = request.total_chunks;
    let mut failure = None;

    info!(
        owner = %request.owner,
        content_hash = %request.content_hash,
        total_chunks = total,
        relays = request.relays.len(),
        cached = entry.distinct(),
        "starting chunk collection"
    );

    let filter = Filter::new()
        .author(request.owner.as_hex())
        .kind(CHUNK_KIND)
        .tag(TAG_CONTENT, request.content_hash.as_str());
    match source.subscribe(&request.relays, &filter).await {
        Ok(subscription) => {
            let reason = drain_subscription(subscription, entry, total, settings).await;
            debug!(
                content_hash = %request.content_hash,
                reason = ?reason,
                received = entry.distinct(),
                "subscription closed"
            );
        }
        Err(e) => {
            warn!(content_hash = %request.content_hash, error = %e, "chunk subscription failed");
            failure = Some(e.to_string());
        }
    }

    if entry.distinct() < total as usize {
        if let Err(e) = fetch_hinted(source, entry, request, settings.id_batch_size).await {
            warn!(content_hash = %request.content_hash, error = %e, "fallback lookup failed");
            failure.get_or_insert_with(|| e.to_string());
        }
    }

    let received = entry.distinct();
    info!(
        content_hash = %request.content_hash,
        received,
        total_chunks = total,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "chunk collection finished"
    );

    match failure {
        Some(msg) if received < total as usize => CollectStatus::Failed(msg),
        _ => CollectStatus::Finished,
    }
}

async fn drain_subscription(
    mut subscription: Subscription,
    entry: &CacheEntry,
    total: u32,
    settings: CollectorSettings,
) -> StopReason {
    let total = total as usize;
    let started = Instant::now();
    let mut last_progress = started;
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(SubscriptionEvent::Record(record)) => match entry.ingest(&record, total as u32) {
                    Ingest::Inserted(count) => {
                        last_progress = Instant::now();
                        if count >= total {
                            break StopReason::Complete;
                        }
                    }
                    other => debug!(record_id = %record.id, outcome = ?other, "chunk record skipped"),
                },
                Some(SubscriptionEvent::EndOfStoredRecords) => {
                    debug!(received = entry.distinct(), "relays sent all stored chunks");
                }
                None => break StopReason::StreamEnded,
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                if entry.distinct() >= total {
                    break StopReason::Complete;
                }
                if now.duration_since(last_progress) >= settings.inactivity_timeout {
                    break StopReason::Inactive;
                }
                if now.duration_since(started) >= settings.max_wait {
                    break StopReason::Ceiling;
                }
            }
        }
    };

    subscription.close();
    reason
}

/// Looks up missing chunks by their hinted record ids.
async fn fetch_hinted(
    source: &dyn RecordSource,
    entry: &CacheEntry,
    request: &CollectRequest,
    batch_size: usize,
) -> Result<()> {
    let missing: HashSet<u32> = entry.missing(request.total_chunks).into_iter().collect();
    let ids: Vec<String> = request
        .hints
        .iter()
        .filter(|h| missing.contains(&h.index))
        .map(|h| h.record_id.clone())
        .collect();
    if ids.is_empty() {
        debug!(missing = missing.len(), "no record id hints for missing chunks");
        return Ok(());
    }

    debug!(missing = missing.len(), hinted = ids.len(), "fetching hinted chunks by id");
    for batch in ids.chunks(batch_size.max(1)) {
        let filter = Filter::new()
            .author(request.owner.as_hex())
            .kind(CHUNK_KIND)
            .ids(batch.iter().cloned());
        let records = source.query(&request.relays, &filter).await?;
        for record in &records {
            entry.ingest(record, request.total_chunks);
        }
        if entry.distinct() >= request.total_chunks as usize {
            break;
        }
    }
    Ok(())
}
