use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{
  CacheManager, ConnectivityProbe, EmptyResponseFactory, HashAlgorithm, Hasher, KeyValueStore,
  MemoryStore, PersistenceDefaults, PersistenceManager, SerialisationFlags, SerialisationPipeline,
  SqliteStore, SystemClock,
};
use crate::error::CacheError;

/// Environment variable holding the encryption passphrase.
pub const CACHE_KEY_VAR: &str = "REPRISE_CACHE_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Time to live of new entries when the instruction sets none
  pub ttl_secs: u64,
  /// Compress new entries unless told otherwise
  pub compress: bool,
  /// Encrypt new entries unless told otherwise (needs REPRISE_CACHE_KEY)
  pub encrypt: bool,
  pub hash_algorithm: HashAlgorithm,
  /// Attach `Cacheable::empty()` payloads to EMPTY and DONE results
  pub empty_responses: bool,
  pub connectivity_poll_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 3600,
      compress: false,
      encrypt: false,
      hash_algorithm: HashAlgorithm::default(),
      empty_responses: false,
      connectivity_poll_ms: 250,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Bounded in-process LRU, lost on exit
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  pub max_entries: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      backend: StorageBackend::default(),
      path: None,
      max_entries: MemoryStore::DEFAULT_MAX_ENTRIES,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./reprise.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/reprise/config.yaml
  ///
  /// Defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("reprise.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("reprise").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.ttl_secs == 0 {
      return Err(CacheError::Config("cache.ttl_secs must be greater than zero".into()).into());
    }
    if self.storage.max_entries == 0 {
      return Err(
        CacheError::Config("storage.max_entries must be greater than zero".into()).into(),
      );
    }
    Ok(())
  }

  /// Get the encryption passphrase from the environment, if set.
  pub fn cache_key() -> Option<String> {
    std::env::var(CACHE_KEY_VAR).ok().filter(|key| !key.is_empty())
  }

  pub fn persistence_defaults(&self) -> PersistenceDefaults {
    PersistenceDefaults {
      ttl: Duration::from_secs(self.cache.ttl_secs),
      flags: SerialisationFlags::new(self.cache.compress, self.cache.encrypt),
    }
  }

  /// Builds a manager over the given store using this configuration.
  ///
  /// `connectivity` is polled every `cache.connectivity_poll_ms` while a
  /// request waits for the network.
  pub fn build_manager<S: KeyValueStore + 'static>(
    &self,
    store: Arc<S>,
    passphrase: Option<&str>,
    connectivity: Arc<dyn ConnectivityProbe>,
  ) -> CacheManager<S> {
    let persistence = PersistenceManager::new(
      store,
      SerialisationPipeline::standard(passphrase),
      Arc::new(SystemClock),
      self.persistence_defaults(),
    );

    CacheManager::new(persistence)
      .with_hasher(Hasher::new(self.cache.hash_algorithm))
      .with_empty_responses(EmptyResponseFactory::new(self.cache.empty_responses))
      .with_connectivity(
        connectivity,
        Duration::from_millis(self.cache.connectivity_poll_ms),
      )
  }

  pub fn open_sqlite(&self) -> Result<SqliteStore> {
    let store = match &self.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    Ok(store)
  }

  pub fn memory_store(&self) -> MemoryStore {
    MemoryStore::new(self.storage.max_entries)
  }
}
