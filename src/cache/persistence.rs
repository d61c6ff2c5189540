//! Typed entries on top of a [`KeyValueStore`].
//!
//! The store key carries all entry metadata (see [`EntryKey`]); the request
//! hash is used as a partial key so at most one live entry exists per hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryKey, SerialisationFlags};
use super::fingerprint::FingerprintedRequest;
use super::instruction::CacheOperation;
use super::serialisation::SerialisationPipeline;
use super::status::CacheStatus;
use super::storage::{lock, KeyValueStore};
use super::traits::{Cacheable, Clock};
use crate::error::{CacheError, Result};

/// A deserialised entry and its freshness at read time.
#[derive(Debug, Clone)]
pub struct CachedResponse<R> {
  pub data: R,
  pub key: EntryKey,
  /// `Fresh` or `Stale`.
  pub status: CacheStatus,
}

impl<R> CachedResponse<R> {
  pub fn is_stale(&self) -> bool {
    self.status == CacheStatus::Stale
  }
}

/// Defaults applied when an instruction leaves a setting open.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceDefaults {
  pub ttl: Duration,
  pub flags: SerialisationFlags,
}

impl Default for PersistenceDefaults {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(3600),
      flags: SerialisationFlags::NONE,
    }
  }
}

pub struct PersistenceManager<S: KeyValueStore> {
  store: Arc<S>,
  pipeline: SerialisationPipeline,
  clock: Arc<dyn Clock>,
  defaults: PersistenceDefaults,
  /// One lock per request hash; mutations of the same hash never interleave.
  key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: KeyValueStore> PersistenceManager<S> {
  pub fn new(
    store: Arc<S>,
    pipeline: SerialisationPipeline,
    clock: Arc<dyn Clock>,
    defaults: PersistenceDefaults,
  ) -> Self {
    Self {
      store,
      pipeline,
      clock,
      defaults,
      key_locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Raw entry for a request, if one exists and its key is well-formed.
  pub fn get(&self, request: &FingerprintedRequest) -> Result<Option<CacheEntry>> {
    let Some(raw_key) = self
      .store
      .find_partial_key(&EntryKey::prefix(&request.request_hash))?
    else {
      return Ok(None);
    };

    let Some(key) = EntryKey::parse(&raw_key) else {
      warn!(key = %raw_key, "ignoring entry with malformed key");
      return Ok(None);
    };

    Ok(
      self
        .store
        .get(&raw_key)?
        .map(|payload| CacheEntry { key, payload }),
    )
  }

  /// Reads and deserialises the entry for a request.
  ///
  /// Never fails: storage errors and undecodable payloads are logged and
  /// reported as a miss. Corrupt entries are deleted; entries that need a
  /// decorator this pipeline lacks are left in place.
  pub fn read<R: Cacheable>(&self, request: &FingerprintedRequest) -> Option<CachedResponse<R>> {
    let entry = match self.get(request) {
      Ok(Some(entry)) => entry,
      Ok(None) => return None,
      Err(e) => {
        warn!(request_hash = %request.request_hash, error = %e, "cache read failed");
        return None;
      }
    };

    match self.pipeline.deserialise::<R>(&entry.payload, entry.key.flags) {
      Ok(data) => {
        let status = if entry.key.is_stale_at(self.clock.now_millis()) {
          CacheStatus::Stale
        } else {
          CacheStatus::Fresh
        };
        debug!(
          request_hash = %request.request_hash,
          type_name = R::type_name(),
          %status,
          "found cached entry"
        );
        Some(CachedResponse {
          data,
          key: entry.key,
          status,
        })
      }
      Err(e @ CacheError::DecoratorUnavailable(_)) => {
        warn!(
          request_hash = %request.request_hash,
          type_name = R::type_name(),
          error = %e,
          "cannot decode cached entry with this configuration, skipping it"
        );
        None
      }
      Err(e) => {
        warn!(
          request_hash = %request.request_hash,
          type_name = R::type_name(),
          error = %e,
          "could not deserialise cached entry, deleting it"
        );
        let key = entry.key.encode();
        if let Err(e) = self.with_key_lock(&request.request_hash, || self.store.delete(&key)) {
          warn!(error = %e, "could not delete corrupt entry");
        }
        None
      }
    }
  }

  /// Flags for a new entry: explicit instruction values win, then the
  /// previous entry's flags, then the configured defaults.
  pub fn flags_for(
    &self,
    operation: &CacheOperation,
    previous: Option<&EntryKey>,
  ) -> SerialisationFlags {
    let previous = previous.map(|key| key.flags);
    let requested = SerialisationFlags {
      compressed: operation
        .compress
        .or(previous.map(|f| f.compressed))
        .unwrap_or(self.defaults.flags.compressed),
      encrypted: operation
        .encrypt
        .or(previous.map(|f| f.encrypted))
        .unwrap_or(self.defaults.flags.encrypted),
    };

    let supported = self.pipeline.supports(requested);
    if supported != requested {
      warn!(?requested, ?supported, "requested decorator is not available");
    }
    supported
  }

  /// Serialises and stores a fetched response. Nothing is written if
  /// serialisation fails.
  pub fn write<R: Cacheable>(
    &self,
    request: &FingerprintedRequest,
    data: &R,
    operation: &CacheOperation,
    previous: Option<&EntryKey>,
  ) -> Result<EntryKey> {
    let flags = self.flags_for(operation, previous);
    let payload = self.pipeline.serialise(data, flags)?;

    let ttl = operation.ttl.unwrap_or(self.defaults.ttl);
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let cached_at = self.clock.now_millis();

    let key = EntryKey {
      request_hash: request.request_hash.clone(),
      type_hash: request.type_hash.clone(),
      cached_at,
      expires_at: cached_at.saturating_add(ttl_millis),
      flags,
    };

    self.put(CacheEntry {
      key: key.clone(),
      payload,
    })?;

    debug!(
      request_hash = %key.request_hash,
      type_name = request.type_name,
      expires_at = key.expires_at,
      "cached response"
    );
    Ok(key)
  }

  /// Replaces any entry with the same request hash.
  pub fn put(&self, entry: CacheEntry) -> Result<()> {
    let request_hash = entry.key.request_hash.clone();
    self.with_key_lock(&request_hash, || {
      if let Some(existing) = self
        .store
        .find_partial_key(&EntryKey::prefix(&request_hash))?
      {
        self.store.delete(&existing)?;
      }
      self.store.save(&entry.key.encode(), entry.payload)
    })
  }

  /// Forces the entry to expire. Returns whether an entry was found.
  pub fn invalidate(&self, request: &FingerprintedRequest) -> Result<bool> {
    self.with_key_lock(&request.request_hash, || {
      let Some(raw_key) = self
        .store
        .find_partial_key(&EntryKey::prefix(&request.request_hash))?
      else {
        return Ok(false);
      };

      let Some(key) = EntryKey::parse(&raw_key) else {
        warn!(key = %raw_key, "cannot invalidate entry with malformed key");
        return Ok(false);
      };

      if key.expires_at != 0 {
        self.store.rename(&raw_key, &key.invalidated().encode())?;
        debug!(request_hash = %request.request_hash, "invalidated entry");
      }
      Ok(true)
    })
  }

  /// Deletes entries of one type (or all types), optionally only expired ones.
  /// Returns the number of entries removed.
  pub fn clear(&self, type_hash: Option<&str>, stale_only: bool) -> Result<usize> {
    let now = self.clock.now_millis();
    let mut removed = 0;

    for raw_key in self.store.values()?.into_keys() {
      let Some(key) = EntryKey::parse(&raw_key) else {
        continue;
      };
      let right_type = type_hash.map_or(true, |hash| key.type_hash == hash);
      let right_expiry = !stale_only || key.is_stale_at(now);
      if right_type && right_expiry {
        self.store.delete(&raw_key)?;
        removed += 1;
      }
    }

    debug!(?type_hash, stale_only, removed, "cleared cache");
    Ok(removed)
  }

  /// Metadata of every well-formed entry.
  pub fn entries(&self) -> Result<Vec<EntryKey>> {
    let mut keys: Vec<EntryKey> = self
      .store
      .values()?
      .into_keys()
      .filter_map(|raw| EntryKey::parse(&raw))
      .collect();
    keys.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
    Ok(keys)
  }

  pub fn now_millis(&self) -> i64 {
    self.clock.now_millis()
  }

  fn with_key_lock<T>(&self, request_hash: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
    let key_lock = {
      let mut locks = lock(&self.key_locks)?;
      Arc::clone(locks.entry(request_hash.to_string()).or_default())
    };

    let result = {
      let _guard = lock(&key_lock)?;
      action()
    };

    // Drop the map slot once nobody else is waiting on it.
    let mut locks = lock(&self.key_locks)?;
    if Arc::strong_count(&key_lock) == 2 {
      locks.remove(request_hash);
    }
    result
  }
}
