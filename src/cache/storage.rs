//! Key-value store contract and the in-memory and SQLite implementations.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{CacheError, Result};

/// Trait for cache storage backends.
///
/// Keys are opaque strings; values are the serialised payload bytes.
pub trait KeyValueStore: Send + Sync {
  /// First key starting with `prefix`, if any.
  fn find_partial_key(&self, prefix: &str) -> Result<Option<String>>;

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn save(&self, key: &str, value: Vec<u8>) -> Result<()>;

  fn delete(&self, key: &str) -> Result<()>;

  /// Moves the value stored under `old_key` to `new_key`. No-op if `old_key` is absent.
  fn rename(&self, old_key: &str, new_key: &str) -> Result<()>;

  /// Snapshot of every key and value.
  fn values(&self) -> Result<HashMap<String, Vec<u8>>>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex
    .lock()
    .map_err(|e| CacheError::storage(format!("Lock poisoned: {}", e)))
}

/// Least-recently-used in-memory store backed by a bounded Moka cache.
pub struct MemoryStore {
  cache: Cache<String, Vec<u8>>,
}

impl MemoryStore {
  pub const DEFAULT_MAX_ENTRIES: usize = 20;

  pub fn new(max_entries: usize) -> Self {
    let max_entries = u64::try_from(max_entries.max(1)).unwrap_or(u64::MAX);
    let cache = Cache::builder()
      .max_capacity(max_entries)
      .eviction_policy(EvictionPolicy::lru())
      .build();

    debug!(max_entries, "memory store created");
    Self { cache }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new(Self::DEFAULT_MAX_ENTRIES)
  }
}

impl KeyValueStore for MemoryStore {
  fn find_partial_key(&self, prefix: &str) -> Result<Option<String>> {
    Ok(
      self
        .cache
        .iter()
        .find(|(key, _)| key.starts_with(prefix))
        .map(|(key, _)| key.to_string()),
    )
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.cache.get(key))
  }

  fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
    self.cache.insert(key.to_string(), value);
    // Evict now so the entry count never exceeds the capacity between saves.
    self.cache.run_pending_tasks();
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.cache.invalidate(key);
    Ok(())
  }

  fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
    if let Some(value) = self.cache.get(old_key) {
      self.cache.invalidate(old_key);
      self.cache.insert(new_key.to_string(), value);
      self.cache.run_pending_tasks();
    }
    Ok(())
  }

  fn values(&self) -> Result<HashMap<String, Vec<u8>>> {
    Ok(
      self
        .cache
        .iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect(),
    )
  }
}

/// SQLite-based store implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the entry table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY NOT NULL,
    data BLOB NOT NULL
);
"#;

impl SqliteStore {
  /// Create a new SQLite store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create a store at the given path, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::storage("Could not determine data directory"))?;

    Ok(data_dir.join("reprise").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    lock(&self.conn)?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::storage(format!("Failed to run cache migrations: {}", e)))
  }
}

impl KeyValueStore for SqliteStore {
  fn find_partial_key(&self, prefix: &str) -> Result<Option<String>> {
    let conn = lock(&self.conn)?;
    // substr rather than LIKE: `_` is a LIKE wildcard and also our key separator.
    let key = conn
      .query_row(
        "SELECT key FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1 LIMIT 1",
        params![prefix],
        |row| row.get(0),
      )
      .optional()?;
    Ok(key)
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = lock(&self.conn)?;
    let data = conn
      .query_row(
        "SELECT data FROM cache_entries WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(data)
  }

  fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
    lock(&self.conn)?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, data) VALUES (?1, ?2)",
        params![key, value],
      )
      .map_err(|e| CacheError::storage(format!("Failed to store entry: {}", e)))?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    lock(&self.conn)?.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
    Ok(())
  }

  fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
    let mut conn = lock(&self.conn)?;
    let tx = conn.transaction()?;
    let exists = tx
      .query_row(
        "SELECT 1 FROM cache_entries WHERE key = ?1",
        params![old_key],
        |_| Ok(()),
      )
      .optional()?
      .is_some();
    if exists {
      tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![new_key])?;
      tx.execute(
        "UPDATE cache_entries SET key = ?2 WHERE key = ?1",
        params![old_key, new_key],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  fn values(&self) -> Result<HashMap<String, Vec<u8>>> {
    let conn = lock(&self.conn)?;
    let mut stmt = conn.prepare("SELECT key, data FROM cache_entries")?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
      .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(rows)
  }
}
