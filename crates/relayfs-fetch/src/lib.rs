#![warn(missing_docs)]

//! RelayFS fetch subsystem: index and manifest resolution, chunk collection
//! from relays, sealed-chunk decryption and file assembly

pub mod assembler;
pub mod cache;
pub mod cipher;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod index;
pub mod keys;
pub mod manifest;
pub mod model;
pub mod record;
pub mod session;
pub mod source;

pub use assembler::Assembler;
pub use cache::{CacheKey, CacheStats, ChunkCache};
pub use cipher::ConversationKey;
pub use collector::{ChunkCollector, CollectRequest, CollectorSettings, Progress};
pub use config::FetchConfig;
pub use error::{CipherError, FetchError, Result};
pub use index::IndexResolver;
pub use keys::{OwnerKey, SecretKey};
pub use manifest::ManifestResolver;
pub use model::{ChunkInfo, ChunkRecord, EncryptionMode, FileEntry, FileIndexPage, Manifest};
pub use record::{Filter, Record};
pub use session::{DownloadedFile, FetchSession};
pub use source::{MemorySource, RecordSource, Subscription, SubscriptionEvent};
