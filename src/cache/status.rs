//! Status attached to every emitted result.

use std::fmt;

/// Where a result came from and whether more results will follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
  /// Internal: the request has been resolved into an instruction only.
  Instruction,
  /// Fetched without touching the cache.
  NotCached,
  /// Fetched and cached, no previous entry existed.
  Fresh,
  /// Served from a valid cache entry.
  Cached,
  /// Served from an expired entry while a refresh runs. Always followed by another result.
  Stale,
  /// Fetched and cached, replacing an expired entry.
  Refreshed,
  /// The refresh failed; the expired data is returned along with the error.
  CouldNotRefresh,
  /// No data could be returned.
  Empty,
  /// A cache operation (invalidate, clear) completed; carries no data.
  Done,
}

impl CacheStatus {
  /// Whether this is the last result for a request.
  pub fn is_final(self) -> bool {
    !matches!(self, Self::Instruction | Self::Stale)
  }

  /// Whether the payload comes from a valid entry or a successful fetch.
  pub fn is_fresh(self) -> bool {
    matches!(self, Self::NotCached | Self::Fresh | Self::Cached | Self::Refreshed)
  }

  pub fn is_error(self) -> bool {
    matches!(self, Self::CouldNotRefresh | Self::Empty)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Instruction => "INSTRUCTION",
      Self::NotCached => "NOT_CACHED",
      Self::Fresh => "FRESH",
      Self::Cached => "CACHED",
      Self::Stale => "STALE",
      Self::Refreshed => "REFRESHED",
      Self::CouldNotRefresh => "COULD_NOT_REFRESH",
      Self::Empty => "EMPTY",
      Self::Done => "DONE",
    }
  }
}

impl fmt::Display for CacheStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
