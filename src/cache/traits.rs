//! Core traits for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Mutex;

/// Trait for response types that can be cached.
///
/// The type name is hashed into the `typeHash` of every entry, so two
/// response types fetched from the same URL never share a cache slot. It is
/// persisted through that hash and must not change between builds; use
/// [`cacheable!`](crate::cacheable) to derive it from the module path.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Fully-qualified type name used for the type hash.
  fn type_name() -> &'static str;

  /// Placeholder instance for results that carry no data.
  /// Returns None if the type has no sensible empty value.
  fn empty() -> Option<Self> {
    None
  }
}

/// Implements [`Cacheable`] with the type's path as its name.
///
/// ```ignore
/// reprise::cacheable!(CatFact);
/// ```
#[macro_export]
macro_rules! cacheable {
  ($ty:ident) => {
    impl $crate::cache::Cacheable for $ty {
      fn type_name() -> &'static str {
        concat!(module_path!(), "::", stringify!($ty))
      }
    }
  };
}

impl Cacheable for String {
  fn type_name() -> &'static str {
    "alloc::string::String"
  }

  fn empty() -> Option<Self> {
    Some(String::new())
  }
}

impl Cacheable for serde_json::Value {
  fn type_name() -> &'static str {
    "serde_json::Value"
  }

  fn empty() -> Option<Self> {
    Some(serde_json::Value::Null)
  }
}

/// Produces payloads for `EMPTY` and `DONE` results.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResponseFactory {
  enabled: bool,
}

impl EmptyResponseFactory {
  pub fn new(enabled: bool) -> Self {
    Self { enabled }
  }

  pub fn create<R: Cacheable>(&self) -> Option<R> {
    if self.enabled {
      R::empty()
    } else {
      None
    }
  }
}

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn at_millis(millis: i64) -> Self {
    Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
  }

  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Reports whether the network is currently reachable.
pub trait ConnectivityProbe: Send + Sync {
  fn is_online(&self) -> bool;
}

/// Probe used when no connectivity information is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
  fn is_online(&self) -> bool {
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
  struct Fact {
    text: String,
  }

  crate::cacheable!(Fact);

  #[test]
  fn type_names_follow_the_module_path() {
    assert_eq!(Fact::type_name(), "reprise::cache::traits::tests::Fact");
    assert_eq!(String::type_name(), "alloc::string::String");
    assert_eq!(serde_json::Value::type_name(), "serde_json::Value");
  }

  #[test]
  fn empty_factory_only_builds_when_enabled() {
    assert_eq!(EmptyResponseFactory::new(true).create::<String>(), Some(String::new()));
    assert_eq!(EmptyResponseFactory::new(false).create::<String>(), None);
    assert!(EmptyResponseFactory::new(true).create::<Fact>().is_none());
  }

  #[test]
  fn manual_clock_advances() {
    let clock = ManualClock::at_millis(1_000);
    clock.advance(chrono::Duration::milliseconds(500));
    assert_eq!(clock.now_millis(), 1_500);
  }
}
