//! Results emitted by the cache manager and the stream that delivers them.

use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::entry::{EntryKey, SerialisationFlags};
use super::instruction::CacheInstruction;
use super::status::CacheStatus;

/// Milliseconds spent reading the store, waiting on the upstream, and overall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallDuration {
  pub disk: u64,
  pub network: u64,
  pub total: u64,
}

/// Metadata describing how a result was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheToken {
  pub instruction: CacheInstruction,
  pub status: CacheStatus,
  /// None when the request could not be fingerprinted.
  pub request_hash: Option<String>,
  pub type_hash: Option<String>,
  pub flags: SerialisationFlags,
  /// When the upstream call completed, for network results.
  pub fetched_at: Option<DateTime<Utc>>,
  pub cached_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl CacheToken {
  pub(crate) fn new(instruction: CacheInstruction, status: CacheStatus) -> Self {
    Self {
      instruction,
      status,
      request_hash: None,
      type_hash: None,
      flags: SerialisationFlags::NONE,
      fetched_at: None,
      cached_at: None,
      expires_at: None,
    }
  }

  pub(crate) fn with_key(mut self, key: &EntryKey) -> Self {
    self.request_hash = Some(key.request_hash.clone());
    self.type_hash = Some(key.type_hash.clone());
    self.flags = key.flags;
    self.cached_at = DateTime::from_timestamp_millis(key.cached_at);
    self.expires_at = DateTime::from_timestamp_millis(key.expires_at);
    self
  }
}

/// One emitted result. The payload is absent for `EMPTY` and `DONE` unless
/// empty-response synthesis produced one.
#[derive(Debug, Clone)]
pub struct CacheResult<R, E> {
  pub data: Option<R>,
  pub token: CacheToken,
  pub error: Option<E>,
  pub duration: CallDuration,
}

impl<R, E> CacheResult<R, E> {
  pub fn status(&self) -> CacheStatus {
    self.token.status
  }

  pub fn is_final(&self) -> bool {
    self.token.status.is_final()
  }
}

/// Ordered results of one `resolve` call: at most a `STALE` result followed
/// by exactly one final result.
///
/// Dropping this before the final result arrives cancels the pending fetch.
pub struct CacheResponses<R, E> {
  rx: mpsc::Receiver<CacheResult<R, E>>,
}

impl<R, E> CacheResponses<R, E> {
  pub(crate) fn new(rx: mpsc::Receiver<CacheResult<R, E>>) -> Self {
    Self { rx }
  }

  pub async fn next(&mut self) -> Option<CacheResult<R, E>> {
    self.rx.recv().await
  }

  /// The final result, for consumers that only want one answer.
  pub async fn last(mut self) -> Option<CacheResult<R, E>> {
    let mut last = None;
    while let Some(result) = self.rx.recv().await {
      if result.is_final() {
        last = Some(result);
      }
    }
    last
  }

  pub async fn collect_all(mut self) -> Vec<CacheResult<R, E>> {
    let mut results = Vec::with_capacity(2);
    while let Some(result) = self.rx.recv().await {
      results.push(result);
    }
    results
  }
}

impl<R, E> Stream for CacheResponses<R, E> {
  type Item = CacheResult<R, E>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}
