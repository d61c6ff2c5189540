//! Error kinds raised inside the cache and the classification of fetch failures.

use color_eyre::Report;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Failures produced by the cache itself.
///
/// None of these cross the public `resolve` boundary as an `Err`: they are
/// converted through an [`ErrorFactory`] and attached to the emitted result.
#[derive(Debug, Error)]
pub enum CacheError {
  /// The request could not be turned into a fingerprint (unparsable URL).
  #[error("could not fingerprint request for {url}: {reason}")]
  Fingerprint { url: String, reason: String },

  /// The payload could not be serialised, decorated, or read back.
  #[error("serialisation failed: {0}")]
  Serialisation(String),

  /// An entry needs a decorator this process was not configured with
  /// (for example, encrypted entries without a passphrase).
  #[error("serialisation decorator not available: {0}")]
  DecoratorUnavailable(String),

  /// The backing key-value store failed.
  #[error("storage failure: {0}")]
  Storage(String),

  /// The upstream fetch did not complete within the request timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Connectivity did not come back within the connectivity timeout.
  #[error("no network connectivity after waiting {0:?}")]
  Offline(Duration),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl CacheError {
  pub fn serialisation(cause: impl fmt::Display) -> Self {
    Self::Serialisation(cause.to_string())
  }

  pub fn storage(cause: impl fmt::Display) -> Self {
    Self::Storage(cause.to_string())
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialisation(e.to_string())
  }
}

/// Implemented by the caller's error type so the cache can tell network
/// failures apart from everything else.
pub trait NetworkErrorPredicate {
  fn is_network_error(&self) -> bool;
}

/// Converts any failure seen while resolving a request into the caller's
/// error type.
pub trait ErrorFactory: Send + Sync + 'static {
  type Error: NetworkErrorPredicate + fmt::Debug + Send + Sync + 'static;

  fn create(&self, cause: Report) -> Self::Error;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
  Network,
  Other,
}

/// Error type produced by [`DefaultErrorFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
  pub kind: FetchErrorKind,
  pub message: String,
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.kind {
      FetchErrorKind::Network => write!(f, "network error: {}", self.message),
      FetchErrorKind::Other => f.write_str(&self.message),
    }
  }
}

impl std::error::Error for FetchError {}

impl NetworkErrorPredicate for FetchError {
  fn is_network_error(&self) -> bool {
    self.kind == FetchErrorKind::Network
  }
}

/// Classifies a report by walking its cause chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorFactory;

impl DefaultErrorFactory {
  fn is_network(report: &Report) -> bool {
    report.chain().any(|cause| {
      if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
        return e.is_connect() || e.is_timeout() || e.is_request();
      }
      if let Some(e) = cause.downcast_ref::<CacheError>() {
        return matches!(e, CacheError::Timeout(_) | CacheError::Offline(_));
      }
      if let Some(e) = cause.downcast_ref::<std::io::Error>() {
        return matches!(
          e.kind(),
          std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::TimedOut
        );
      }
      false
    })
  }
}

impl ErrorFactory for DefaultErrorFactory {
  type Error = FetchError;

  fn create(&self, cause: Report) -> FetchError {
    let kind = if Self::is_network(&cause) {
      FetchErrorKind::Network
    } else {
      FetchErrorKind::Other
    };
    FetchError {
      kind,
      message: format!("{:#}", cause),
    }
  }
}
