//! Runtime configuration for sealed-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every knob of the cache engine (chunking, expiry, capacity, crypto cost,
//! timeouts) lives here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 25_600;
/// Default item lifetime: 7 days.
pub const DEFAULT_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INITIAL_CLEANUP_DELAY_MS: u64 = 10_000;
pub const DEFAULT_KEY_DERIVATION_ITERATIONS: u32 = 100_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_WORKER_INIT_TIMEOUT_MS: u64 = 30_000;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "sealed-cache", about = "Encrypted chunked persistent cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "sealed-cache.json")]
    pub config: PathBuf,

    /// Secret used to derive item ids and the encryption key.
    #[arg(long, env = "SEALED_CACHE_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Generation tag; changing it invalidates everything written under the old one.
    #[arg(long)]
    pub generation_tag: Option<String>,

    /// Override the store file location.
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// One cache operation per invocation.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the value stored under KEY.
    Get { key: String },
    /// Store VALUE (or the contents of --file) under KEY.
    Set {
        key: String,
        value: Option<String>,
        #[arg(long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Remove KEY.
    Remove { key: String },
    /// Print the number of stored chunk records.
    Count,
    /// Remove everything.
    Clear,
    /// Run one expiry / generation / capacity sweep.
    Cleanup,
}

/// Cache configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Confidential secret. Required at construction.
    pub secret: Option<String>,

    /// Non-confidential generation tag, also the key-derivation salt.
    pub generation_tag: String,

    /// Maximum plaintext bytes per chunk.
    pub chunk_size: usize,

    /// Item lifetime in milliseconds, refreshed on every write.
    pub max_age_ms: u64,

    /// Hard cap on stored chunk records (unset = unbounded).
    pub max_total_chunks: Option<u64>,

    /// Period of the background cleanup sweep.
    pub cleanup_interval_ms: u64,

    /// Delay between becoming ready and the first background sweep.
    pub initial_cleanup_delay_ms: u64,

    /// PBKDF2 iteration count.
    pub key_derivation_iterations: u32,

    /// Yield to the scheduler at every suspension point.
    pub low_latency_mode: bool,

    /// Per-request timeout for crypto round-trips.
    pub request_timeout_ms: u64,

    /// Timeout for the crypto engine handshake (includes key derivation).
    pub worker_init_timeout_ms: u64,

    /// SQLite file backing the store.
    pub store_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            secret: None,
            generation_tag: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            max_total_chunks: None,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            initial_cleanup_delay_ms: DEFAULT_INITIAL_CLEANUP_DELAY_MS,
            key_derivation_iterations: DEFAULT_KEY_DERIVATION_ITERATIONS,
            low_latency_mode: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            worker_init_timeout_ms: DEFAULT_WORKER_INIT_TIMEOUT_MS,
            store_path: PathBuf::from("sealed-cache.db"),
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("generation_tag", &self.generation_tag)
            .field("chunk_size", &self.chunk_size)
            .field("max_age_ms", &self.max_age_ms)
            .field("max_total_chunks", &self.max_total_chunks)
            .field("cleanup_interval_ms", &self.cleanup_interval_ms)
            .field("initial_cleanup_delay_ms", &self.initial_cleanup_delay_ms)
            .field("key_derivation_iterations", &self.key_derivation_iterations)
            .field("low_latency_mode", &self.low_latency_mode)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("worker_init_timeout_ms", &self.worker_init_timeout_ms)
            .field("store_path", &self.store_path)
            .finish()
    }
}

impl CacheConfig {
    /// Configuration with the given secret and generation tag, defaults elsewhere.
    pub fn new(secret: impl Into<String>, generation_tag: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            generation_tag: generation_tag.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CacheConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CacheConfig::default())
        }
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(secret) = &cli.secret {
            self.secret = Some(secret.clone());
        }
        if let Some(tag) = &cli.generation_tag {
            self.generation_tag = tag.clone();
        }
        if let Some(store) = &cli.store {
            self.store_path = store.clone();
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.secret.is_none() {
            return Err(CacheError::InvalidConfig("secret is required".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(CacheError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.key_derivation_iterations == 0 {
            return Err(CacheError::InvalidConfig(
                "key_derivation_iterations must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn initial_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.initial_cleanup_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn worker_init_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_init_timeout_ms)
    }
}
