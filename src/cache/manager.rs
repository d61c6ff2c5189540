//! Cache manager that resolves instructions against the store and the upstream.

use chrono::{DateTime, Utc};
use color_eyre::Report;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use super::entry::EntryKey;
use super::fingerprint::{FingerprintedRequest, Hasher, RequestIdentity};
use super::instruction::{CacheInstruction, CacheOperation, CachePriority, ClearScope, Operation};
use super::persistence::{CachedResponse, PersistenceManager};
use super::result::{CacheResponses, CacheResult, CacheToken, CallDuration};
use super::status::CacheStatus;
use super::storage::KeyValueStore;
use super::traits::{AlwaysOnline, Cacheable, ConnectivityProbe, EmptyResponseFactory};
use crate::error::{CacheError, DefaultErrorFactory, ErrorFactory};

/// How often the connectivity probe is polled while waiting to go online.
pub const DEFAULT_CONNECTIVITY_POLL: Duration = Duration::from_millis(250);

type Responses<R, F> = CacheResponses<R, <F as ErrorFactory>::Error>;
type Sender<R, F> = mpsc::Sender<CacheResult<R, <F as ErrorFactory>::Error>>;

/// Resolves requests with stale-while-revalidate semantics.
///
/// The store read and the decision happen on the calling task; upstream
/// fetches always run on a spawned task, so `resolve` must be called from
/// within a tokio runtime.
pub struct CacheManager<S: KeyValueStore, F: ErrorFactory = DefaultErrorFactory> {
  persistence: Arc<PersistenceManager<S>>,
  hasher: Hasher,
  error_factory: Arc<F>,
  empty_factory: EmptyResponseFactory,
  connectivity: Arc<dyn ConnectivityProbe>,
  connectivity_poll: Duration,
}

/// Per-call bookkeeping shared by every result of one `resolve`.
struct Call {
  instruction: CacheInstruction,
  request: Option<FingerprintedRequest>,
  started: Instant,
  disk_millis: u64,
  network_millis: u64,
}

impl Call {
  fn new(instruction: CacheInstruction) -> Self {
    Self {
      instruction,
      request: None,
      started: Instant::now(),
      disk_millis: 0,
      network_millis: 0,
    }
  }
}

/// What a result should say, before timing and error conversion.
struct Outcome<R> {
  status: CacheStatus,
  data: Option<R>,
  key: Option<EntryKey>,
  error: Option<Report>,
  fetched_at: Option<DateTime<Utc>>,
}

impl<R> Outcome<R> {
  fn new(status: CacheStatus) -> Self {
    Self {
      status,
      data: None,
      key: None,
      error: None,
      fetched_at: None,
    }
  }

  fn cached(status: CacheStatus, cached: CachedResponse<R>) -> Self {
    Self {
      data: Some(cached.data),
      key: Some(cached.key),
      ..Self::new(status)
    }
  }

  fn with_error(mut self, error: Report) -> Self {
    self.error = Some(error);
    self
  }

  fn fetched(mut self, data: R, at: Option<DateTime<Utc>>) -> Self {
    self.data = Some(data);
    self.fetched_at = at;
    self
  }
}

impl<S: KeyValueStore + 'static> CacheManager<S, DefaultErrorFactory> {
  pub fn new(persistence: PersistenceManager<S>) -> Self {
    Self::with_error_factory(persistence, DefaultErrorFactory)
  }
}

impl<S: KeyValueStore + 'static, F: ErrorFactory> CacheManager<S, F> {
  pub fn with_error_factory(persistence: PersistenceManager<S>, error_factory: F) -> Self {
    Self {
      persistence: Arc::new(persistence),
      hasher: Hasher::default(),
      error_factory: Arc::new(error_factory),
      empty_factory: EmptyResponseFactory::default(),
      connectivity: Arc::new(AlwaysOnline),
      connectivity_poll: DEFAULT_CONNECTIVITY_POLL,
    }
  }

  pub fn with_hasher(mut self, hasher: Hasher) -> Self {
    self.hasher = hasher;
    self
  }

  pub fn with_empty_responses(mut self, factory: EmptyResponseFactory) -> Self {
    self.empty_factory = factory;
    self
  }

  pub fn with_connectivity(mut self, probe: Arc<dyn ConnectivityProbe>, poll: Duration) -> Self {
    self.connectivity = probe;
    self.connectivity_poll = poll.max(Duration::from_millis(1));
    self
  }

  pub fn persistence(&self) -> &PersistenceManager<S> {
    &self.persistence
  }

  pub fn hasher(&self) -> Hasher {
    self.hasher
  }

  /// Resolves one request.
  ///
  /// Yields a single final result, or a `STALE` result followed by a final
  /// one when expired data may be served while it is refreshed. Failures are
  /// attached to the results, never returned.
  pub fn resolve<R, Fetch, Fut>(
    &self,
    instruction: CacheInstruction,
    identity: RequestIdentity<R>,
    fetch: Fetch,
  ) -> Responses<R, F>
  where
    R: Cacheable,
    Fetch: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<R>> + Send + 'static,
  {
    // Never more than two results per call.
    let (tx, rx) = mpsc::channel(2);
    let mut call = Call::new(instruction);

    let request = match self.hasher.fingerprint(&identity) {
      Ok(request) => request,
      Err(e) => {
        warn!(url = %identity.url, error = %e, "could not fingerprint request");
        let outcome = Outcome::new(CacheStatus::Empty).with_error(Report::new(e));
        self.emit_now(&tx, &call, outcome);
        return CacheResponses::new(rx);
      }
    };
    call.request = Some(request.clone());

    debug!(
      request_hash = %request.request_hash,
      type_name = request.type_name,
      operation = call.instruction.operation.name(),
      "resolving request"
    );

    match call.instruction.operation.clone() {
      Operation::Invalidate => {
        let outcome = match self.persistence.invalidate(&request) {
          Ok(found) => {
            debug!(request_hash = %request.request_hash, found, "invalidate done");
            Outcome::new(CacheStatus::Done)
          }
          Err(e) => Outcome::new(CacheStatus::Empty).with_error(Report::new(e)),
        };
        self.emit_now(&tx, &call, outcome);
      }
      Operation::Clear { scope, stale_only } => {
        let type_hash = match scope {
          ClearScope::All => None,
          ClearScope::RequestType => Some(request.type_hash.as_str()),
        };
        let outcome = match self.persistence.clear(type_hash, stale_only) {
          Ok(removed) => {
            info!(removed, stale_only, "cleared cache entries");
            Outcome::new(CacheStatus::Done)
          }
          Err(e) => Outcome::new(CacheStatus::Empty).with_error(Report::new(e)),
        };
        self.emit_now(&tx, &call, outcome);
      }
      Operation::DoNotCache {
        request_timeout,
        connectivity_timeout,
      } => {
        self.spawn_uncached(tx, call, fetch, connectivity_timeout, request_timeout);
      }
      Operation::Cache(operation) => {
        self.resolve_cached(tx, call, request, operation, fetch);
      }
    }

    CacheResponses::new(rx)
  }

  fn resolve_cached<R, Fetch, Fut>(
    &self,
    tx: Sender<R, F>,
    mut call: Call,
    request: FingerprintedRequest,
    operation: CacheOperation,
    fetch: Fetch,
  ) where
    R: Cacheable,
    Fetch: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<R>> + Send + 'static,
  {
    let priority = operation.priority;

    let disk_started = Instant::now();
    let mut cached = self.persistence.read::<R>(&request);
    call.disk_millis = millis(disk_started.elapsed());

    if !priority.uses_network() {
      let outcome = match cached {
        Some(entry) if !entry.is_stale() || priority.falls_back_to_stale() => {
          Outcome::cached(CacheStatus::Cached, entry)
        }
        _ => Outcome::new(CacheStatus::Empty),
      };
      debug!(request_hash = %request.request_hash, status = %outcome.status, "served local only");
      self.emit_now(&tx, &call, outcome);
      return;
    }

    if priority.invalidates_existing() {
      if let Some(entry) = cached.as_mut() {
        if let Err(e) = self.persistence.invalidate(&request) {
          warn!(request_hash = %request.request_hash, error = %e, "could not invalidate entry");
        }
        entry.key = entry.key.invalidated();
        entry.status = CacheStatus::Stale;
      }
    }

    match cached {
      Some(entry) if !entry.is_stale() => {
        debug!(request_hash = %request.request_hash, "serving valid cached entry");
        self.emit_now(&tx, &call, Outcome::cached(CacheStatus::Cached, entry));
      }
      previous => {
        if let Some(entry) = previous.as_ref().filter(|_| priority.emits_cached_stale()) {
          debug!(request_hash = %request.request_hash, "serving stale entry while refreshing");
          self.emit_now(&tx, &call, Outcome::cached(CacheStatus::Stale, entry.clone()));
        }
        self.spawn_refresh(tx, call, request, operation, previous, fetch);
      }
    }
  }

  fn spawn_refresh<R, Fetch, Fut>(
    &self,
    tx: Sender<R, F>,
    mut call: Call,
    request: FingerprintedRequest,
    operation: CacheOperation,
    previous: Option<CachedResponse<R>>,
    fetch: Fetch,
  ) where
    R: Cacheable,
    Fetch: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<R>> + Send + 'static,
  {
    let manager = self.clone();
    tokio::spawn(async move {
      let network_started = Instant::now();
      let fetched = tokio::select! {
        _ = tx.closed() => {
          debug!(request_hash = %request.request_hash, "receiver dropped, abandoning refresh");
          return;
        }
        fetched = manager.fetch_upstream(
          fetch,
          operation.connectivity_timeout,
          operation.request_timeout,
        ) => fetched,
      };
      call.network_millis = millis(network_started.elapsed());

      if tx.is_closed() {
        debug!(request_hash = %request.request_hash, "receiver dropped, not caching response");
        return;
      }

      let outcome = manager.store_fetched(&request, &operation, previous, fetched);
      let result = manager.to_result(&call, outcome);
      if tx.send(result).await.is_err() {
        debug!(request_hash = %request.request_hash, "receiver dropped before final result");
      }
    });
  }

  fn spawn_uncached<R, Fetch, Fut>(
    &self,
    tx: Sender<R, F>,
    mut call: Call,
    fetch: Fetch,
    connectivity_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
  ) where
    R: Cacheable,
    Fetch: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = color_eyre::Result<R>> + Send + 'static,
  {
    let manager = self.clone();
    tokio::spawn(async move {
      let network_started = Instant::now();
      let fetched = tokio::select! {
        _ = tx.closed() => return,
        fetched = manager.fetch_upstream(fetch, connectivity_timeout, request_timeout) => fetched,
      };
      call.network_millis = millis(network_started.elapsed());

      let outcome = match fetched {
        Ok(data) => Outcome::new(CacheStatus::NotCached).fetched(data, manager.now()),
        Err(error) => {
          warn!(error = %error, "uncached fetch failed");
          Outcome::new(CacheStatus::Empty).with_error(error)
        }
      };
      let _ = tx.send(manager.to_result(&call, outcome)).await;
    });
  }

  /// Persists a successful fetch, or falls back to the previous entry.
  fn store_fetched<R: Cacheable>(
    &self,
    request: &FingerprintedRequest,
    operation: &CacheOperation,
    previous: Option<CachedResponse<R>>,
    fetched: color_eyre::Result<R>,
  ) -> Outcome<R> {
    let fetched_at = self.now();
    let previous_key = previous.as_ref().map(|entry| &entry.key);

    let written = fetched.and_then(|data| {
      let key = self
        .persistence
        .write(request, &data, operation, previous_key)?;
      Ok((data, key))
    });

    match written {
      Ok((data, key)) => {
        let status = if previous.is_some() {
          CacheStatus::Refreshed
        } else {
          CacheStatus::Fresh
        };
        info!(request_hash = %request.request_hash, %status, "fetched and cached response");
        Outcome {
          key: Some(key),
          ..Outcome::new(status).fetched(data, fetched_at)
        }
      }
      Err(error) => self.refresh_failed(request, operation.priority, previous, error),
    }
  }

  fn refresh_failed<R>(
    &self,
    request: &FingerprintedRequest,
    priority: CachePriority,
    previous: Option<CachedResponse<R>>,
    error: Report,
  ) -> Outcome<R> {
    match previous {
      Some(entry) if priority.falls_back_to_stale() => {
        warn!(
          request_hash = %request.request_hash,
          error = %error,
          "refresh failed, returning previous data"
        );
        Outcome::cached(CacheStatus::CouldNotRefresh, entry).with_error(error)
      }
      _ => {
        warn!(request_hash = %request.request_hash, error = %error, "fetch failed");
        Outcome::new(CacheStatus::Empty).with_error(error)
      }
    }
  }

  async fn fetch_upstream<R, Fetch, Fut>(
    &self,
    fetch: Fetch,
    connectivity_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
  ) -> color_eyre::Result<R>
  where
    Fetch: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<R>>,
  {
    if let Some(limit) = connectivity_timeout {
      self.wait_for_connectivity(limit).await?;
    }

    match request_timeout {
      Some(limit) => time::timeout(limit, fetch())
        .await
        .map_err(|_| Report::new(CacheError::Timeout(limit)))?,
      None => fetch().await,
    }
  }

  async fn wait_for_connectivity(&self, limit: Duration) -> color_eyre::Result<()> {
    let probe = Arc::clone(&self.connectivity);
    let poll = self.connectivity_poll;
    time::timeout(limit, async move {
      while !probe.is_online() {
        time::sleep(poll).await;
      }
    })
    .await
    .map_err(|_| Report::new(CacheError::Offline(limit)))
  }

  fn emit_now<R: Cacheable>(&self, tx: &Sender<R, F>, call: &Call, outcome: Outcome<R>) {
    // Capacity covers every synchronous emission, so this only fails once
    // the receiver is gone.
    if tx.try_send(self.to_result(call, outcome)).is_err() {
      debug!("receiver dropped before result was emitted");
    }
  }

  fn to_result<R: Cacheable>(&self, call: &Call, outcome: Outcome<R>) -> CacheResult<R, F::Error> {
    let mut token = CacheToken::new(call.instruction.clone(), outcome.status);
    if let Some(request) = &call.request {
      token.request_hash = Some(request.request_hash.clone());
      token.type_hash = Some(request.type_hash.clone());
    }
    if let Some(key) = &outcome.key {
      token = token.with_key(key);
    }
    token.fetched_at = outcome.fetched_at;

    let data = match outcome.data {
      Some(data) => Some(data),
      None if matches!(outcome.status, CacheStatus::Empty | CacheStatus::Done) => {
        self.empty_factory.create::<R>()
      }
      None => None,
    };

    CacheResult {
      data,
      token,
      error: outcome.error.map(|e| self.error_factory.create(e)),
      duration: CallDuration {
        disk: call.disk_millis,
        network: call.network_millis,
        total: millis(call.started.elapsed()),
      },
    }
  }

  fn now(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.persistence.now_millis())
  }
}

impl<S: KeyValueStore, F: ErrorFactory> Clone for CacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      persistence: Arc::clone(&self.persistence),
      hasher: self.hasher,
      error_factory: Arc::clone(&self.error_factory),
      empty_factory: self.empty_factory,
      connectivity: Arc::clone(&self.connectivity),
      connectivity_poll: self.connectivity_poll,
    }
  }
}

fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::persistence::PersistenceDefaults;
  use crate::cache::serialisation::SerialisationPipeline;
  use crate::cache::storage::MemoryStore;
  use crate::cache::traits::ManualClock;
  use crate::error::NetworkErrorPredicate;
  use color_eyre::eyre::eyre;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use tokio::sync::oneshot;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Fact {
    text: String,
  }

  impl Cacheable for Fact {
    fn type_name() -> &'static str {
      "reprise::cache::manager::tests::Fact"
    }

    fn empty() -> Option<Self> {
      Some(fact(""))
    }
  }

  /// Serialises like `Fact` until asked to fail.
  #[derive(Debug, Clone, PartialEq, Deserialize)]
  struct Fragile {
    text: String,
    #[serde(skip)]
    unencodable: bool,
  }

  crate::cacheable!(Fragile);

  impl Serialize for Fragile {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
      S: serde::Serializer,
    {
      use serde::ser::{Error, SerializeStruct};

      if self.unencodable {
        return Err(S::Error::custom("payload cannot be encoded"));
      }
      let mut state = serializer.serialize_struct("Fragile", 1)?;
      state.serialize_field("text", &self.text)?;
      state.end()
    }
  }

  fn fragile(text: &str, unencodable: bool) -> Fragile {
    Fragile {
      text: text.to_string(),
      unencodable,
    }
  }

  const T0: i64 = 1_700_000_000_000;
  const URL: &str = "http://cats.example/fact?a=1&b=2";

  fn fact(text: &str) -> Fact {
    Fact {
      text: text.to_string(),
    }
  }

  fn manager() -> (CacheManager<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_millis(T0));
    let persistence = PersistenceManager::new(
      Arc::new(MemoryStore::default()),
      SerialisationPipeline::default(),
      clock.clone(),
      PersistenceDefaults::default(),
    );
    (CacheManager::new(persistence), clock)
  }

  fn identity() -> RequestIdentity<Fact> {
    RequestIdentity::new(URL)
  }

  fn with_priority(priority: CachePriority) -> CacheInstruction {
    CacheInstruction::cache(CacheOperation::new(priority).with_ttl(Duration::from_secs(60)))
  }

  fn statuses<R, E>(results: &[CacheResult<R, E>]) -> Vec<CacheStatus> {
    results.iter().map(|r| r.status()).collect()
  }

  /// Caches "old" and lets it expire.
  async fn seed_stale(manager: &CacheManager<MemoryStore>, clock: &ManualClock) {
    let seeded = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await
      .unwrap();
    assert_eq!(seeded.status(), CacheStatus::Fresh);
    clock.advance(chrono::Duration::seconds(61));
  }

  #[tokio::test]
  async fn miss_fetches_and_caches() {
    let (manager, _) = manager();

    let results = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Fresh]);
    assert_eq!(results[0].data, Some(fact("new")));
    assert_eq!(
      results[0].token.expires_at.map(|t| t.timestamp_millis()),
      Some(T0 + 60_000)
    );
    assert_eq!(manager.persistence().entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn valid_entry_is_served_without_fetching() {
    let (manager, _) = manager();
    manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await;

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let results = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok(fact("new"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Cached]);
    assert_eq!(results[0].data, Some(fact("old")));
    assert!(!called.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn stale_entry_is_served_then_refreshed() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;

    let results = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Stale, CacheStatus::Refreshed]);
    assert_eq!(results[0].data, Some(fact("old")));
    assert_eq!(results[1].data, Some(fact("new")));
    assert!(!results[0].is_final());
  }

  #[tokio::test]
  async fn fresh_only_never_emits_stale() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;

    let results = manager
      .resolve(with_priority(CachePriority::FRESH_ONLY), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Refreshed]);
  }

  #[tokio::test]
  async fn failed_refresh_returns_previous_data() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;

    let results = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Err(eyre!("HTTP 503"))
      })
      .collect_all()
      .await;

    assert_eq!(
      statuses(&results),
      vec![CacheStatus::Stale, CacheStatus::CouldNotRefresh]
    );
    let last = &results[1];
    assert_eq!(last.data, Some(fact("old")));
    assert!(last.error.as_ref().unwrap().message.contains("HTTP 503"));
  }

  #[tokio::test]
  async fn fresh_preferred_falls_back_without_emitting_stale() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;

    let results = manager
      .resolve(
        with_priority(CachePriority::FRESH_PREFERRED),
        identity(),
        || async { Err(eyre!("HTTP 503")) },
      )
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::CouldNotRefresh]);
    assert_eq!(results[0].data, Some(fact("old")));
  }

  #[tokio::test]
  async fn fresh_only_failure_is_empty() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;

    let results = manager
      .resolve(with_priority(CachePriority::FRESH_ONLY), identity(), || async {
        Err(eyre!("HTTP 503"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Empty]);
    assert_eq!(results[0].data, None);
    assert!(results[0].error.is_some());
  }

  #[tokio::test]
  async fn failed_fetch_is_never_persisted() {
    let (manager, _) = manager();

    let result = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Err(eyre!("HTTP 500"))
      })
      .last()
      .await
      .unwrap();

    assert_eq!(result.status(), CacheStatus::Empty);
    assert!(manager.persistence().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn staleness_boundary() {
    let (manager, clock) = manager();
    manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await;

    clock.advance(chrono::Duration::milliseconds(59_999));
    let almost = manager
      .resolve(with_priority(CachePriority::OFFLINE_FRESH_ONLY), identity(), || async {
        Ok(fact("unused"))
      })
      .last()
      .await
      .unwrap();
    assert_eq!(almost.status(), CacheStatus::Cached);

    clock.advance(chrono::Duration::milliseconds(1));
    let expired = manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;
    assert_eq!(statuses(&expired), vec![CacheStatus::Stale, CacheStatus::Refreshed]);
  }

  #[tokio::test]
  async fn local_only_never_fetches() {
    let (manager, clock) = manager();
    let called = Arc::new(AtomicBool::new(false));

    let flag = called.clone();
    let miss = manager
      .resolve(with_priority(CachePriority::OFFLINE), identity(), move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok(fact("new"))
      })
      .collect_all()
      .await;
    assert_eq!(statuses(&miss), vec![CacheStatus::Empty]);
    assert!(miss[0].error.is_none());

    seed_stale(&manager, &clock).await;
    let stale = manager
      .resolve(with_priority(CachePriority::OFFLINE), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;
    assert_eq!(statuses(&stale), vec![CacheStatus::Cached]);
    assert_eq!(stale[0].data, Some(fact("old")));

    let fresh_only = manager
      .resolve(with_priority(CachePriority::OFFLINE_FRESH_ONLY), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;
    assert_eq!(statuses(&fresh_only), vec![CacheStatus::Empty]);
    assert!(!called.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn force_network_refreshes_valid_entries() {
    let (manager, _) = manager();
    manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await;

    let results = manager
      .resolve(with_priority(CachePriority::INVALIDATED), identity(), || async {
        Ok(fact("new"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Stale, CacheStatus::Refreshed]);
    assert_eq!(results[1].data, Some(fact("new")));
  }

  #[tokio::test]
  async fn force_network_failure_leaves_entry_invalidated() {
    let (manager, _) = manager();
    manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await;

    let result = manager
      .resolve(
        with_priority(CachePriority::INVALIDATED_FRESH_ONLY),
        identity(),
        || async { Err(eyre!("HTTP 502")) },
      )
      .last()
      .await
      .unwrap();

    assert_eq!(result.status(), CacheStatus::Empty);
    let keys = manager.persistence().entries().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].expires_at, 0);
  }

  #[tokio::test]
  async fn do_not_cache_bypasses_the_store() {
    let (manager, _) = manager();

    let results = manager
      .resolve(CacheInstruction::do_not_cache(), identity(), || async {
        Ok(fact("live"))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::NotCached]);
    assert_eq!(results[0].data, Some(fact("live")));
    assert!(results[0].token.fetched_at.is_some());
    assert!(manager.persistence().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn do_not_cache_honours_both_timeouts() {
    let (manager, _) = manager();
    let timed = CacheInstruction::new(Operation::DoNotCache {
      request_timeout: Some(Duration::from_millis(20)),
      connectivity_timeout: None,
    });
    let result = manager
      .resolve(timed, identity(), || async {
        time::sleep(Duration::from_secs(10)).await;
        Ok(fact("late"))
      })
      .last()
      .await
      .unwrap();
    assert_eq!(result.status(), CacheStatus::Empty);
    assert!(result.error.unwrap().message.contains("timed out"));

    let manager = manager.with_connectivity(Arc::new(Offline), Duration::from_millis(5));
    let waiting = CacheInstruction::new(Operation::DoNotCache {
      request_timeout: None,
      connectivity_timeout: Some(Duration::from_millis(30)),
    });
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let result = manager
      .resolve(waiting, identity(), move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok(fact("unused"))
      })
      .last()
      .await
      .unwrap();
    assert_eq!(result.status(), CacheStatus::Empty);
    assert!(result.error.unwrap().is_network_error());
    assert!(!called.load(Ordering::SeqCst));
    assert!(manager.persistence().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn unencodable_refresh_keeps_the_stale_entry() {
    let (manager, clock) = manager();
    let request = || RequestIdentity::<Fragile>::new(URL);
    manager
      .resolve(with_priority(CachePriority::DEFAULT), request(), || async {
        Ok(fragile("old", false))
      })
      .last()
      .await;
    clock.advance(chrono::Duration::seconds(61));
    let before = manager.persistence().entries().unwrap();

    let results = manager
      .resolve(with_priority(CachePriority::DEFAULT), request(), || async {
        Ok(fragile("new", true))
      })
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Stale, CacheStatus::CouldNotRefresh]);
    assert_eq!(results[1].data, Some(fragile("old", false)));
    let error = results[1].error.as_ref().unwrap();
    assert!(error.message.contains("payload cannot be encoded"));
    assert!(!error.is_network_error());
    assert_eq!(manager.persistence().entries().unwrap(), before);
  }

  #[tokio::test]
  async fn unencodable_response_without_entry_is_empty() {
    let (manager, _) = manager();

    let results = manager
      .resolve(
        with_priority(CachePriority::DEFAULT),
        RequestIdentity::<Fragile>::new(URL),
        || async { Ok(fragile("new", true)) },
      )
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Empty]);
    assert!(results[0].data.is_none());
    assert!(manager.persistence().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn invalidate_and_clear_emit_done() {
    let (manager, _) = manager();
    manager
      .resolve(with_priority(CachePriority::DEFAULT), identity(), || async {
        Ok(fact("old"))
      })
      .last()
      .await;

    let invalidated = manager
      .resolve(CacheInstruction::invalidate(), identity(), || async {
        Ok(fact("unused"))
      })
      .collect_all()
      .await;
    assert_eq!(statuses(&invalidated), vec![CacheStatus::Done]);
    assert_eq!(manager.persistence().entries().unwrap()[0].expires_at, 0);

    let cleared = manager
      .resolve(
        CacheInstruction::clear(ClearScope::RequestType, false),
        identity(),
        || async { Ok(fact("unused")) },
      )
      .collect_all()
      .await;
    assert_eq!(statuses(&cleared), vec![CacheStatus::Done]);
    assert_eq!(cleared[0].data, None);
    assert!(manager.persistence().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn empty_results_carry_synthesised_payloads() {
    let (manager, _) = manager();
    let manager = manager.with_empty_responses(EmptyResponseFactory::new(true));

    let result = manager
      .resolve(with_priority(CachePriority::OFFLINE), identity(), || async {
        Ok(fact("unused"))
      })
      .last()
      .await
      .unwrap();

    assert_eq!(result.status(), CacheStatus::Empty);
    assert_eq!(result.data, Some(fact("")));
  }

  #[tokio::test]
  async fn unparsable_urls_resolve_to_empty() {
    let (manager, _) = manager();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let results = manager
      .resolve(
        CacheInstruction::default(),
        RequestIdentity::<Fact>::new("http://[::1"),
        move || async move {
          flag.store(true, Ordering::SeqCst);
          Ok(fact("unused"))
        },
      )
      .collect_all()
      .await;

    assert_eq!(statuses(&results), vec![CacheStatus::Empty]);
    assert!(results[0].token.request_hash.is_none());
    assert!(!results[0].error.as_ref().unwrap().is_network_error());
    assert!(!called.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn request_timeout_is_a_network_failure() {
    let (manager, _) = manager();
    let instruction = CacheInstruction::cache(
      CacheOperation::new(CachePriority::DEFAULT).with_request_timeout(Duration::from_millis(20)),
    );

    let result = manager
      .resolve(instruction, identity(), || async {
        time::sleep(Duration::from_secs(10)).await;
        Ok(fact("late"))
      })
      .last()
      .await
      .unwrap();

    assert_eq!(result.status(), CacheStatus::Empty);
    assert!(result.error.unwrap().is_network_error());
  }

  struct Offline;

  impl ConnectivityProbe for Offline {
    fn is_online(&self) -> bool {
      false
    }
  }

  #[tokio::test]
  async fn connectivity_wait_gives_up() {
    let (manager, _) = manager();
    let manager = manager.with_connectivity(Arc::new(Offline), Duration::from_millis(5));
    let instruction = CacheInstruction::cache(
      CacheOperation::new(CachePriority::DEFAULT)
        .with_connectivity_timeout(Duration::from_millis(30)),
    );
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let result = manager
      .resolve(instruction, identity(), move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok(fact("unused"))
      })
      .last()
      .await
      .unwrap();

    assert_eq!(result.status(), CacheStatus::Empty);
    assert!(result.error.unwrap().message.contains("no network connectivity"));
    assert!(!called.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn dropping_the_receiver_cancels_the_refresh() {
    let (manager, clock) = manager();
    seed_stale(&manager, &clock).await;
    let before = manager.persistence().entries().unwrap();

    let (mut release, waiting) = oneshot::channel::<()>();
    let mut responses = manager.resolve(
      with_priority(CachePriority::DEFAULT),
      identity(),
      move || async move {
        let _ = waiting.await;
        Ok(fact("new"))
      },
    );

    let stale = responses.next().await.unwrap();
    assert_eq!(stale.status(), CacheStatus::Stale);
    drop(responses);

    // Resolves once the abandoned fetch future has been dropped.
    time::timeout(Duration::from_secs(5), release.closed())
      .await
      .unwrap();
    assert!(release.send(()).is_err());

    assert_eq!(manager.persistence().entries().unwrap(), before);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_refreshes_leave_one_entry() {
    let (manager, _) = manager();
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
      let manager = manager.clone();
      let fetches = fetches.clone();
      handles.push(tokio::spawn(async move {
        manager
          .resolve(
            with_priority(CachePriority::INVALIDATED),
            identity(),
            move || async move {
              fetches.fetch_add(1, Ordering::SeqCst);
              Ok(fact(&format!("fetch {i}")))
            },
          )
          .last()
          .await
      }));
    }
    for handle in handles {
      let result = handle.await.unwrap().unwrap();
      assert!(result.status().is_fresh());
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 8);
    let entries = manager.persistence().entries().unwrap();
    assert_eq!(entries.len(), 1);
  }
}
