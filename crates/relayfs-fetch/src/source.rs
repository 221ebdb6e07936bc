//! Record source abstraction for the relay network.
//!
//! This module defines the `RecordSource` trait the pipeline talks to, the
//! `Subscription` handle for live queries, and `MemorySource`, an in-process
//! implementation used for offline snapshots and deterministic tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FetchError, Result};
use crate::record::{Filter, Record};

/// Relay key under which records visible on every relay are stored.
const ANY_RELAY: &str = "*";

/// One item delivered by a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A matching record (stored or newly published).
    Record(Record),
    /// The relays finished sending stored records. More may still follow.
    EndOfStoredRecords,
}

/// Handle to a live subscription. Dropping or closing it ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Subscription {
    /// Wraps the receiving half of a subscription channel.
    pub fn new(events: mpsc::UnboundedReceiver<SubscriptionEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the source has ended the stream.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Ends the subscription. The source observes the closed channel.
    pub fn close(mut self) {
        self.events.close();
    }
}

/// Peer-query service that holds published records.
///
/// Implementations fan the request out to every endpoint in `relays` and merge
/// the answers; duplicates across relays are expected and handled by callers.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// One-shot query.
    ///
    /// # Arguments
    /// * `relays` - Endpoints to ask.
    /// * `filter` - Selection criteria.
    ///
    /// # Returns
    /// Every matching record the relays returned (finite).
    async fn query(&self, relays: &[String], filter: &Filter) -> Result<Vec<Record>>;

    /// Opens a live subscription.
    ///
    /// # Arguments
    /// * `relays` - Endpoints to subscribe on.
    /// * `filter` - Selection criteria.
    ///
    /// # Returns
    /// A handle yielding stored records, an end-of-stored marker, then live records.
    async fn subscribe(&self, relays: &[String], filter: &Filter) -> Result<Subscription>;
}

struct LiveSubscription {
    relays: Vec<String>,
    filter: Filter,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, Vec<Record>>,
    live: Vec<LiveSubscription>,
}

fn visible_on(relay: &str, relays: &[String]) -> bool {
    relay == ANY_RELAY || relays.iter().any(|r| r == relay)
}

/// In-memory record source.
///
/// Records published with `publish` are visible on every relay; records
/// published with `publish_to` only on the named relay, so a record held by
/// two relays is returned twice, as a real relay set would.
#[derive(Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
    stream_delay: Duration,
    subscriptions_opened: AtomicUsize,
    queries_issued: AtomicUsize,
    fail_requests: AtomicBool,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source pre-loaded with records visible on every relay.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let source = Self::new();
        for record in records {
            source.publish(record);
        }
        source
    }

    /// Delays each stored record streamed into a subscription by `delay`.
    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = delay;
        self
    }

    /// Publishes a record on every relay, forwarding it to open subscriptions.
    pub fn publish(&self, record: Record) {
        self.publish_on(ANY_RELAY, record);
    }

    /// Publishes a record on one relay only.
    pub fn publish_to(&self, relay: &str, record: Record) {
        self.publish_on(relay, record);
    }

    fn publish_on(&self, relay: &str, record: Record) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.live.retain(|sub| !sub.tx.is_closed());
        for sub in &state.live {
            if visible_on(relay, &sub.relays) && sub.filter.matches(&record) {
                let _ = sub.tx.send(SubscriptionEvent::Record(record.clone()));
            }
        }
        state
            .records
            .entry(relay.to_string())
            .or_default()
            .push(record);
    }

    /// Makes every subsequent query and subscribe call fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_requests.store(failing, Ordering::SeqCst);
    }

    /// Number of subscriptions opened so far.
    pub fn subscriptions_opened(&self) -> usize {
        self.subscriptions_opened.load(Ordering::SeqCst)
    }

    /// Number of one-shot queries issued so far.
    pub fn queries_issued(&self) -> usize {
        self.queries_issued.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still open.
    pub fn open_subscriptions(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.live.iter().filter(|s| !s.tx.is_closed()).count()
    }

    fn matching(&self, relays: &[String], filter: &Filter) -> Vec<Record> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<Record> = state
            .records
            .iter()
            .filter(|(relay, _)| visible_on(relay, relays))
            .flat_map(|(_, records)| records.iter())
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            found.truncate(limit);
        }
        found
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(FetchError::source("memory source set to fail"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn query(&self, relays: &[String], filter: &Filter) -> Result<Vec<Record>> {
        self.check_available()?;
        self.queries_issued.fetch_add(1, Ordering::SeqCst);
        let found = self.matching(relays, filter);
        debug!(relays = relays.len(), matched = found.len(), "memory query");
        Ok(found)
    }

    async fn subscribe(&self, relays: &[String], filter: &Filter) -> Result<Subscription> {
        self.check_available()?;
        self.subscriptions_opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let stored = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.live.push(LiveSubscription {
                relays: relays.to_vec(),
                filter: filter.clone(),
                tx: tx.clone(),
            });
            drop(state);
            self.matching(relays, filter)
        };

        let delay = self.stream_delay;
        tokio::spawn(async move {
            for record in stored {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(SubscriptionEvent::Record(record)).is_err() {
                    return;
                }
            }
            let _ = tx.send(SubscriptionEvent::EndOfStoredRecords);
        });

        Ok(Subscription::new(rx))
    }
}
