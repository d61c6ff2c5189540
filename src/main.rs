use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reprise::cache::{
  AlwaysOnline, CacheInstruction, CacheManager, CacheOperation, CachePriority, CacheResult,
  ConnectivityProbe, Freshness, KeyValueStore, NetworkMode, Operation, RequestIdentity,
};
use reprise::config::{Config, StorageBackend};
use reprise::error::FetchError;
use reprise::logging;
use reprise::upstream::{HostProbe, HttpUpstream};

#[derive(Parser, Debug)]
#[command(name = "reprise")]
#[command(about = "Request-level response cache with stale-while-revalidate refreshes")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/reprise/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Resolve a GET request through the cache and print every result
  Fetch {
    url: String,

    /// Extra query parameter as name=value (repeatable)
    #[arg(short, long = "query", value_parser = parse_query_pair)]
    query: Vec<(String, String)>,

    #[arg(long, value_enum, default_value_t = Mode::Cached)]
    mode: Mode,

    #[arg(long, value_enum, default_value_t = FreshnessArg::AcceptStale)]
    freshness: FreshnessArg,

    /// Time to live in seconds (default from config)
    #[arg(long)]
    ttl: Option<u64>,

    /// Compress the stored entry
    #[arg(long)]
    compress: Option<bool>,

    /// Encrypt the stored entry (needs REPRISE_CACHE_KEY)
    #[arg(long)]
    encrypt: Option<bool>,

    /// Give up on the upstream after this many milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Wait at most this many milliseconds for the upstream host to accept connections
    #[arg(long)]
    connectivity_timeout_ms: Option<u64>,
  },
  /// Expire the cached response for a URL
  Invalidate { url: String },
  /// Remove cached responses
  Clear {
    /// Only remove expired entries
    #[arg(long)]
    stale_only: bool,

    /// Only remove JSON responses fetched by this tool
    #[arg(long)]
    json_only: bool,
  },
  /// List cached entries
  List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
  /// Serve from the cache only
  Offline,
  /// Serve valid cached data, fetch otherwise
  Cached,
  /// Invalidate and always fetch
  Refresh,
  /// Bypass the cache entirely
  Bypass,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FreshnessArg {
  AcceptStale,
  FreshPreferred,
  FreshOnly,
}

impl From<FreshnessArg> for Freshness {
  fn from(arg: FreshnessArg) -> Self {
    match arg {
      FreshnessArg::AcceptStale => Freshness::AcceptStale,
      FreshnessArg::FreshPreferred => Freshness::FreshPreferred,
      FreshnessArg::FreshOnly => Freshness::FreshOnly,
    }
  }
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .ok_or_else(|| format!("expected name=value, got {}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log, args.verbose)?;

  match config.storage.backend {
    StorageBackend::Sqlite => run(&config, Arc::new(config.open_sqlite()?), args.command).await,
    StorageBackend::Memory => run(&config, Arc::new(config.memory_store()), args.command).await,
  }
}

async fn run<S: KeyValueStore + 'static>(
  config: &Config,
  store: Arc<S>,
  command: Commands,
) -> Result<()> {
  let passphrase = Config::cache_key();
  if config.cache.encrypt && passphrase.is_none() {
    return Err(eyre!(
      "Encryption is enabled but no key is set. Set the REPRISE_CACHE_KEY environment variable."
    ));
  }
  let connectivity: Arc<dyn ConnectivityProbe> = match &command {
    Commands::Fetch {
      url,
      connectivity_timeout_ms: Some(_),
      ..
    } => Arc::new(HostProbe::for_url(url)?),
    _ => Arc::new(AlwaysOnline),
  };
  let manager = config.build_manager(store, passphrase.as_deref(), connectivity);

  match command {
    Commands::Fetch {
      url,
      query,
      mode,
      freshness,
      ttl,
      compress,
      encrypt,
      request_timeout_ms,
      connectivity_timeout_ms,
    } => {
      if encrypt == Some(true) && passphrase.is_none() {
        return Err(eyre!("--encrypt needs the REPRISE_CACHE_KEY environment variable"));
      }

      let request_timeout = request_timeout_ms.map(Duration::from_millis);
      let connectivity_timeout = connectivity_timeout_ms.map(Duration::from_millis);
      let instruction = match mode {
        Mode::Bypass => CacheInstruction::new(Operation::DoNotCache {
          request_timeout,
          connectivity_timeout,
        }),
        _ => {
          let network = match mode {
            Mode::Offline => NetworkMode::LocalOnly,
            Mode::Refresh => NetworkMode::ForceNetwork,
            _ => NetworkMode::LocalThenNetwork,
          };
          let operation = CacheOperation {
            priority: CachePriority::new(network, freshness.into()),
            ttl: ttl.map(Duration::from_secs),
            compress,
            encrypt,
            connectivity_timeout,
            request_timeout,
          };
          CacheInstruction::cache(operation)
        }
      };

      fetch(&manager, instruction, identity(&url, query)).await
    }
    Commands::Invalidate { url } => {
      let mut responses =
        manager.resolve(CacheInstruction::invalidate(), identity(&url, Vec::new()), || async {
          Err(eyre!("invalidation never fetches"))
        });
      while let Some(result) = responses.next().await {
        print_result(&result);
      }
      Ok(())
    }
    Commands::Clear {
      stale_only,
      json_only,
    } => {
      let type_hash = json_only.then(|| manager.hasher().type_hash::<Value>());
      let removed = manager
        .persistence()
        .clear(type_hash.as_deref(), stale_only)?;
      println!("Removed {} entries", removed);
      Ok(())
    }
    Commands::List => {
      let now = manager.persistence().now_millis();
      for key in manager.persistence().entries()? {
        let state = if key.is_stale_at(now) { "stale" } else { "valid" };
        println!(
          "{}  type={}  cached_at={}  expires_at={}  flags={}  {}",
          key.request_hash,
          key.type_hash,
          key.cached_at,
          key.expires_at,
          key.flags.bits(),
          state
        );
      }
      Ok(())
    }
  }
}

fn identity(url: &str, query: Vec<(String, String)>) -> RequestIdentity<Value> {
  query
    .into_iter()
    .fold(RequestIdentity::new(url), |identity, (name, value)| {
      identity.with_query(name, value)
    })
}

async fn fetch<S: KeyValueStore + 'static>(
  manager: &CacheManager<S>,
  instruction: CacheInstruction,
  identity: RequestIdentity<Value>,
) -> Result<()> {
  let upstream = HttpUpstream::new()?;
  let request = identity.clone();

  let mut responses = manager.resolve(instruction, identity, move || async move {
    upstream.get_json(&request).await
  });

  while let Some(result) = responses.next().await {
    print_result(&result);
  }
  Ok(())
}

fn print_result(result: &CacheResult<Value, FetchError>) {
  let token = &result.token;
  eprintln!(
    "[{}] disk={}ms network={}ms total={}ms{}",
    token.status,
    result.duration.disk,
    result.duration.network,
    result.duration.total,
    token
      .expires_at
      .map(|at| format!(" expires_at={}", at.to_rfc3339()))
      .unwrap_or_default()
  );
  if let Some(error) = &result.error {
    eprintln!("  error: {}", error);
  }
  if let Some(data) = &result.data {
    match serde_json::to_string_pretty(data) {
      Ok(pretty) => println!("{}", pretty),
      Err(e) => eprintln!("  could not print payload: {}", e),
    }
  }
}
