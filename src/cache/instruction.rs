//! Per-request cache directives.
//!
//! How an instruction is built (headers, annotations, config) is up to the
//! caller; the cache only consumes the structured value.

use std::time::Duration;

/// Whether the network may be used, and whether existing data is invalidated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
  /// Serve from the cache only, never fetch.
  LocalOnly,
  /// Serve valid cached data, fetch when missing or expired.
  LocalThenNetwork,
  /// Invalidate any cached data and always fetch.
  ForceNetwork,
}

/// How the caller treats expired data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Emit expired data immediately while refreshing, and fall back to it if the refresh fails.
  AcceptStale,
  /// Wait for the refresh, but fall back to expired data if it fails.
  FreshPreferred,
  /// Never return expired data.
  FreshOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePriority {
  pub mode: NetworkMode,
  pub freshness: Freshness,
}

impl CachePriority {
  pub const DEFAULT: Self = Self::new(NetworkMode::LocalThenNetwork, Freshness::AcceptStale);
  pub const FRESH_PREFERRED: Self =
    Self::new(NetworkMode::LocalThenNetwork, Freshness::FreshPreferred);
  pub const FRESH_ONLY: Self = Self::new(NetworkMode::LocalThenNetwork, Freshness::FreshOnly);
  pub const INVALIDATED: Self = Self::new(NetworkMode::ForceNetwork, Freshness::AcceptStale);
  pub const INVALIDATED_FRESH_ONLY: Self =
    Self::new(NetworkMode::ForceNetwork, Freshness::FreshOnly);
  pub const OFFLINE: Self = Self::new(NetworkMode::LocalOnly, Freshness::AcceptStale);
  pub const OFFLINE_FRESH_ONLY: Self = Self::new(NetworkMode::LocalOnly, Freshness::FreshOnly);

  pub const fn new(mode: NetworkMode, freshness: Freshness) -> Self {
    Self { mode, freshness }
  }

  pub fn uses_network(&self) -> bool {
    self.mode != NetworkMode::LocalOnly
  }

  pub fn invalidates_existing(&self) -> bool {
    self.mode == NetworkMode::ForceNetwork
  }

  /// Whether expired data is emitted as `STALE` before the refresh completes.
  pub fn emits_cached_stale(&self) -> bool {
    self.freshness == Freshness::AcceptStale
  }

  /// Whether expired data may be returned at all (as `CACHED` offline, or `COULD_NOT_REFRESH`).
  pub fn falls_back_to_stale(&self) -> bool {
    self.freshness != Freshness::FreshOnly
  }

  pub fn has_single_response(&self) -> bool {
    !self.uses_network() || !self.emits_cached_stale()
  }
}

impl Default for CachePriority {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Parameters of the `Cache` operation. Unset fields fall back to the
/// previous entry's settings or the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOperation {
  pub priority: CachePriority,
  pub ttl: Option<Duration>,
  pub compress: Option<bool>,
  pub encrypt: Option<bool>,
  /// How long to wait for connectivity before fetching.
  pub connectivity_timeout: Option<Duration>,
  /// Upper bound on the upstream fetch itself.
  pub request_timeout: Option<Duration>,
}

impl CacheOperation {
  pub fn new(priority: CachePriority) -> Self {
    Self {
      priority,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_compression(mut self, compress: bool) -> Self {
    self.compress = Some(compress);
    self
  }

  pub fn with_encryption(mut self, encrypt: bool) -> Self {
    self.encrypt = Some(encrypt);
    self
  }

  pub fn with_connectivity_timeout(mut self, timeout: Duration) -> Self {
    self.connectivity_timeout = Some(timeout);
    self
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = Some(timeout);
    self
  }
}

/// Which entries a `Clear` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
  All,
  /// Only entries of the request's response type.
  RequestType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
  Cache(CacheOperation),
  Invalidate,
  Clear { scope: ClearScope, stale_only: bool },
  DoNotCache {
    request_timeout: Option<Duration>,
    connectivity_timeout: Option<Duration>,
  },
}

impl Operation {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Cache(_) => "CACHE",
      Self::Invalidate => "INVALIDATE",
      Self::Clear { .. } => "CLEAR",
      Self::DoNotCache { .. } => "DO_NOT_CACHE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInstruction {
  pub operation: Operation,
}

impl CacheInstruction {
  pub fn new(operation: Operation) -> Self {
    Self { operation }
  }

  pub fn cache(operation: CacheOperation) -> Self {
    Self::new(Operation::Cache(operation))
  }

  pub fn with_priority(priority: CachePriority) -> Self {
    Self::cache(CacheOperation::new(priority))
  }

  pub fn invalidate() -> Self {
    Self::new(Operation::Invalidate)
  }

  pub fn clear(scope: ClearScope, stale_only: bool) -> Self {
    Self::new(Operation::Clear { scope, stale_only })
  }

  pub fn do_not_cache() -> Self {
    Self::new(Operation::DoNotCache {
      request_timeout: None,
      connectivity_timeout: None,
    })
  }
}

impl Default for CacheInstruction {
  fn default() -> Self {
    Self::with_priority(CachePriority::DEFAULT)
  }
}
