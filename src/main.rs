//! sealed-cache: command-line front end for the encrypted chunked cache.
//!
//! Runs one cache operation against the configured store and exits:
//!   sealed-cache --secret S set greeting "hello"
//!   sealed-cache --secret S get greeting

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sealed_cache::config::{CacheConfig, Cli, Command};
use sealed_cache::SealedCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "sealed_cache=debug"
    } else {
        "sealed_cache=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("sealed-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then apply flag overrides.
    let mut config = CacheConfig::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        store = %config.store_path.display(),
        generation_tag = %config.generation_tag,
        chunk_size = config.chunk_size,
        "Configuration loaded"
    );

    let cache = SealedCache::new(config)?;
    let outcome = run(&cache, cli.command).await;
    cache.destroy(false).await?;
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run one command. Returns false when a `get` finds nothing.
async fn run(cache: &SealedCache, command: Command) -> anyhow::Result<bool> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Command::Get { key } => match cache.get(&key).await? {
            Some(value) => writeln!(stdout, "{value}")?,
            None => {
                info!(key = %key, "Not found");
                return Ok(false);
            }
        },
        Command::Set { key, value, file } => {
            let value = match (value, file) {
                (Some(value), _) => value,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("set needs a VALUE or --file"),
            };
            cache.set(&key, &value).await?;
            info!(key = %key, bytes = value.len(), "Stored");
        }
        Command::Remove { key } => {
            cache.remove(&key).await?;
            info!(key = %key, "Removed");
        }
        Command::Count => writeln!(stdout, "{}", cache.count().await?)?,
        Command::Clear => cache.clear().await?,
        Command::Cleanup => {
            let report = cache.cleanup().await?;
            writeln!(
                stdout,
                "expired={} busted={} evicted_items={} evicted_chunks={}",
                report.expired, report.busted, report.evicted_items, report.evicted_chunks
            )?;
        }
    }
    Ok(true)
}
