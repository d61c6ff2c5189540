//! Request-level response cache.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Fingerprints requests from URL, query parameters, body and response type
//! - Stores payloads through a pluggable key-value store, metadata in the key
//! - Compresses and encrypts payloads per entry
//! - Serves expired data while refreshing it (stale-while-revalidate)

mod entry;
mod fingerprint;
mod instruction;
mod manager;
mod persistence;
mod result;
mod serialisation;
mod status;
mod storage;
mod traits;

pub use entry::{CacheEntry, EntryKey, SerialisationFlags};
pub use fingerprint::{FingerprintedRequest, HashAlgorithm, Hasher, RequestIdentity};
pub use instruction::{
  CacheInstruction, CacheOperation, CachePriority, ClearScope, Freshness, NetworkMode, Operation,
};
pub use manager::{CacheManager, DEFAULT_CONNECTIVITY_POLL};
pub use persistence::{CachedResponse, PersistenceDefaults, PersistenceManager};
pub use result::{CacheResponses, CacheResult, CacheToken, CallDuration};
pub use serialisation::{
  CompressionDecorator, EncryptionDecorator, SerialisationDecorator, SerialisationPipeline,
};
pub use status::CacheStatus;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use traits::{
  AlwaysOnline, Cacheable, Clock, ConnectivityProbe, EmptyResponseFactory, ManualClock,
  SystemClock,
};
