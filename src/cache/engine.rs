//! The cache orchestrator.
//!
//! [`SealedCache`] composes the chunk store, the crypto engine and the cleanup
//! sweep behind `get` / `set` / `remove` / `clear` / `cleanup` / `count` /
//! `destroy`. Every operation first waits for initialization to settle.
//!
//! Concurrent `set` calls for the *same* item key are not serialized; callers
//! must not issue them. Operations on different keys are independent.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::cache::chunker::{chunk_count, plan_chunks};
use crate::cache::evictor::{sweep, SweepPolicy, SweepReport};
use crate::config::CacheConfig;
use crate::crypto::engine::spawn_engine;
use crate::error::{CacheError, Result};
use crate::ident::base_key;
use crate::rpc::channel::{link, InitParams, WorkerChannel, WorkerLink};
use crate::store::record::{ChunkRecord, MAX_CHUNK_INDEX};
use crate::store::sqlite::{ChunkStore, Refresh, WriteBatch};

/// Operations slower than this are logged.
const SLOW_OPERATION: Duration = Duration::from_millis(200);

/// Lifecycle of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Initializing,
    Ready,
    /// Startup or the crypto engine failed; permanent for this instance.
    Degraded,
    Destroyed,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Initializing => "initializing",
            CacheState::Ready => "ready",
            CacheState::Degraded => "degraded",
            CacheState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

struct Backend {
    store: ChunkStore,
    channel: WorkerChannel,
}

struct CacheInner {
    config: CacheConfig,
    secret: RwLock<Option<Zeroizing<String>>>,
    state: watch::Sender<CacheState>,
    backend: OnceLock<Backend>,
    failure: OnceLock<CacheError>,
    cleanup_gate: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheInner {
    fn degrade(&self, err: CacheError) {
        let _ = self.failure.set(err.clone());
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, CacheState::Initializing | CacheState::Ready) {
                *state = CacheState::Degraded;
                true
            } else {
                false
            }
        });
        if changed {
            error!(error = %err, "Cache degraded");
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        // Dropping the backend shuts the channel down and stops the engine.
    }
}

/// Encrypted, chunked persistent cache. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct SealedCache {
    inner: Arc<CacheInner>,
}

impl SealedCache {
    /// Create a cache instance and start initializing it in the background.
    ///
    /// Must be called from within a Tokio runtime. Returns in the
    /// `Initializing` state; operations wait for initialization to finish.
    pub fn new(mut config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let secret = Zeroizing::new(config.secret.take().unwrap_or_default());

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CacheError::CryptoUnavailable(format!("no async runtime: {e}")))?;

        if let Some(parent) = config.store_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::StorageUnavailable(format!("{}: {e}", parent.display()))
                })?;
            }
        }

        let (near, far) = link();
        spawn_engine(far).map_err(|e| CacheError::CryptoUnavailable(e.to_string()))?;

        let params = InitParams {
            secret: Zeroizing::new(secret.as_bytes().to_vec()),
            generation_tag: config.generation_tag.clone(),
            iterations: config.key_derivation_iterations,
        };

        let (state, _) = watch::channel(CacheState::Uninitialized);
        let inner = Arc::new(CacheInner {
            config,
            secret: RwLock::new(Some(secret)),
            state,
            backend: OnceLock::new(),
            failure: OnceLock::new(),
            cleanup_gate: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });
        inner.state.send_replace(CacheState::Initializing);

        let init = runtime.spawn(initialize(Arc::downgrade(&inner), near, params));
        let timer = runtime.spawn(cleanup_timer(
            Arc::downgrade(&inner),
            inner.state.subscribe(),
            inner.config.initial_cleanup_delay(),
            inner.config.cleanup_interval(),
        ));
        inner.tasks.lock().extend([init, timer]);

        info!(
            store = %inner.config.store_path.display(),
            chunk_size = inner.config.chunk_size,
            max_total_chunks = ?inner.config.max_total_chunks,
            "Cache initializing"
        );

        Ok(Self { inner })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CacheState {
        *self.inner.state.borrow()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Wait until initialization has settled and return the backend.
    async fn ready(&self) -> Result<&Backend> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, CacheState::Uninitialized | CacheState::Initializing))
            .await
            .map(|s| *s)
            .map_err(|_| CacheError::Destroyed)?;

        match state {
            CacheState::Ready => {
                let backend = self.inner.backend.get().ok_or(CacheError::Destroyed)?;
                if backend.channel.is_connected() {
                    Ok(backend)
                } else {
                    let err = CacheError::WorkerInitializationFailed(
                        "crypto engine is no longer running".to_string(),
                    );
                    self.inner.degrade(err.clone());
                    Err(err)
                }
            }
            CacheState::Degraded => Err(self.failure()),
            _ => Err(CacheError::Destroyed),
        }
    }

    fn failure(&self) -> CacheError {
        self.inner.failure.get().cloned().unwrap_or_else(|| {
            CacheError::WorkerInitializationFailed("cache is degraded".to_string())
        })
    }

    fn with_secret<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R> {
        let guard = self.inner.secret.read();
        match guard.as_deref() {
            Some(secret) => Ok(f(secret)),
            None => Err(CacheError::Destroyed),
        }
    }

    async fn pause(&self) {
        if self.inner.config.low_latency_mode {
            tokio::task::yield_now().await;
        }
    }

    /// Read an item. Missing, expired and other-generation items are `None`.
    ///
    /// Fails with `IntegrityViolation` rather than returning a partial value.
    pub async fn get(&self, item_key: &str) -> Result<Option<String>> {
        let started = Instant::now();
        let backend = match self.ready().await {
            Ok(backend) => backend,
            Err(e) if self.state() == CacheState::Degraded => {
                debug!(error = %e, "Read on degraded cache");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.pause().await;

        let base = self.with_secret(|secret| base_key(secret, item_key))?;
        let now = now_ms();

        let records = backend
            .store
            .read({
                let base = base.clone();
                move |txn| txn.chunk_records(&base)
            })
            .await?;
        self.pause().await;

        if records.is_empty() {
            return Ok(None);
        }

        if records.iter().any(|r| r.is_expired(now)) {
            let removed = backend
                .store
                .write(move |txn| txn.delete_item(&base))
                .await?;
            debug!(removed, "Expired item removed on read");
            return Ok(None);
        }

        let tag = &self.inner.config.generation_tag;
        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if record.cache_buster != *tag {
                continue;
            }
            let index = record.index().ok_or_else(|| {
                CacheError::integrity(item_key, format!("Malformed chunk key {}", record.key))
            })?;
            live.push((index, record));
        }
        if live.is_empty() {
            return Ok(None);
        }

        verify_complete(item_key, &mut live)?;

        let parts = try_join_all(
            live.into_iter()
                .map(|(_, record)| backend.channel.decrypt(record.iv, record.ciphertext)),
        )
        .await?;
        self.pause().await;

        let mut bytes = Vec::with_capacity(parts.iter().map(Bytes::len).sum());
        for part in &parts {
            bytes.extend_from_slice(part);
        }
        let value = String::from_utf8(bytes).map_err(|_| {
            CacheError::integrity(item_key, "Reassembled value is not valid UTF-8")
        })?;

        log_if_slow("get", started);
        Ok(Some(value))
    }

    /// Store `value` under `item_key`, replacing any previous value.
    pub async fn set(&self, item_key: &str, value: &str) -> Result<()> {
        let started = Instant::now();
        let backend = self.ready().await?;
        self.pause().await;

        let config = &self.inner.config;
        let needed = chunk_count(value.len(), config.chunk_size) as u64;
        let index_limit = u64::from(MAX_CHUNK_INDEX) + 1;
        if needed > index_limit {
            return Err(CacheError::CapacityExceeded {
                needed,
                limit: index_limit,
            });
        }
        if let Some(limit) = config.max_total_chunks {
            if needed > limit {
                return Err(CacheError::CapacityExceeded { needed, limit });
            }
        }

        let tag = config.generation_tag.clone();
        let value = Bytes::copy_from_slice(value.as_bytes());
        let (base, plan) = self.with_secret(|secret| {
            let base = base_key(secret, item_key);
            let plan = plan_chunks(secret, &tag, &base, &value, config.chunk_size);
            (base, plan)
        })?;
        let max_age = i64::try_from(config.max_age().as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms().saturating_add(max_age);

        let existing: HashSet<String> = backend
            .store
            .read(move |txn| txn.chunk_keys(&base))
            .await?
            .into_iter()
            .collect();
        self.pause().await;

        let mut batch = WriteBatch::default();
        let mut fresh = Vec::new();
        for chunk in &plan {
            if existing.contains(&chunk.key) {
                batch.refreshes.push(Refresh {
                    key: chunk.key.clone(),
                    timestamp: expires_at,
                    cache_buster: tag.clone(),
                    is_last_chunk: chunk.is_last,
                });
            } else {
                fresh.push(chunk);
            }
        }
        let planned: HashSet<&str> = plan.iter().map(|c| c.key.as_str()).collect();
        batch.deletes = existing
            .iter()
            .filter(|key| !planned.contains(key.as_str()))
            .cloned()
            .collect();

        let sealed = try_join_all(
            fresh
                .iter()
                .map(|chunk| backend.channel.encrypt(value.slice(chunk.range.clone()))),
        )
        .await?;
        self.pause().await;

        batch.puts = fresh
            .iter()
            .zip(sealed)
            .map(|(chunk, payload)| ChunkRecord {
                key: chunk.key.clone(),
                iv: payload.iv,
                ciphertext: payload.ciphertext,
                timestamp: expires_at,
                cache_buster: tag.clone(),
                is_last_chunk: chunk.is_last,
            })
            .collect();

        let puts = batch.puts.len();
        let refreshes = batch.refreshes.len();
        let deletes = batch.deletes.len();
        backend.store.write(move |txn| txn.apply(&batch)).await?;

        debug!(chunks = plan.len(), puts, refreshes, deletes, "Item stored");
        log_if_slow("set", started);
        Ok(())
    }

    /// Delete every chunk of `item_key`. Not an error if it is absent.
    pub async fn remove(&self, item_key: &str) -> Result<()> {
        let backend = self.ready().await?;
        self.pause().await;
        let base = self.with_secret(|secret| base_key(secret, item_key))?;
        let removed = backend
            .store
            .write(move |txn| txn.delete_item(&base))
            .await?;
        debug!(removed, "Item removed");
        Ok(())
    }

    /// Number of stored chunk records (not items).
    pub async fn count(&self) -> Result<u64> {
        let backend = self.ready().await?;
        self.pause().await;
        Ok(backend.store.read(|txn| txn.count()).await?)
    }

    /// Remove everything from the store.
    pub async fn clear(&self) -> Result<()> {
        let backend = self.ready().await?;
        self.pause().await;
        let removed = backend.store.write(|txn| txn.clear()).await?;
        info!(removed, "Cache cleared");
        Ok(())
    }

    /// Run one expiry / generation / capacity sweep.
    ///
    /// Waits for any sweep already in progress to finish first.
    pub async fn cleanup(&self) -> Result<SweepReport> {
        let _gate = self.inner.cleanup_gate.lock().await;
        self.sweep_now().await
    }

    async fn sweep_now(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let backend = self.ready().await?;
        self.pause().await;

        let policy = SweepPolicy {
            now: now_ms(),
            generation_tag: self.inner.config.generation_tag.clone(),
            max_total_chunks: self.inner.config.max_total_chunks,
        };
        let report = backend.store.write(move |txn| sweep(txn, &policy)).await?;

        if report.total_removed() > 0 {
            info!(
                expired = report.expired,
                busted = report.busted,
                evicted_items = report.evicted_items,
                evicted_chunks = report.evicted_chunks,
                "Cleanup removed records"
            );
        }
        log_if_slow("cleanup", started);
        Ok(report)
    }

    /// Timer-driven sweep: skipped if another sweep is running.
    async fn scheduled_cleanup(&self) {
        let Ok(_gate) = self.inner.cleanup_gate.try_lock() else {
            debug!("Cleanup already running, skipping scheduled sweep");
            return;
        };
        if let Err(e) = self.sweep_now().await {
            warn!(error = %e, "Scheduled cleanup failed");
        }
    }

    /// Tear the instance down, optionally clearing the store first.
    ///
    /// Pending crypto requests fail with `Destroyed`. Idempotent.
    pub async fn destroy(&self, clear_data: bool) -> Result<()> {
        if self.state() == CacheState::Destroyed {
            return Ok(());
        }

        if clear_data {
            match self.ready().await {
                Ok(backend) => {
                    backend.store.write(|txn| txn.clear()).await?;
                }
                Err(CacheError::Destroyed) => return Ok(()),
                Err(e) => warn!(error = %e, "Store not cleared during destroy"),
            }
        }

        let previous = self.inner.state.send_replace(CacheState::Destroyed);
        if previous == CacheState::Destroyed {
            return Ok(());
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(backend) = self.inner.backend.get() {
            backend.channel.shutdown();
        }
        self.inner.secret.write().take();

        info!(cleared = clear_data, "Cache destroyed");
        Ok(())
    }
}

/// Check that `live` holds exactly indices `0..=max` with a last-chunk marker.
///
/// Sorts `live` by index.
fn verify_complete(item_key: &str, live: &mut [(u32, ChunkRecord)]) -> Result<()> {
    live.sort_by_key(|(index, _)| *index);

    let markers = live.iter().filter(|(_, record)| record.is_last_chunk).count();
    match markers {
        0 => return Err(CacheError::integrity(item_key, "Last chunk is missing")),
        1 => {}
        n => {
            return Err(CacheError::integrity(
                item_key,
                format!("Found {n} chunks marked as last"),
            ))
        }
    }

    let max = live.last().map(|(index, _)| *index).unwrap_or(0) as usize;
    if let Some((index, _)) = live.iter().find(|(_, record)| record.is_last_chunk) {
        if *index as usize != max {
            return Err(CacheError::integrity(
                item_key,
                format!("Last chunk is at index {index}, but the highest index is {max}"),
            ));
        }
    }

    if live.len() != max + 1 {
        return Err(CacheError::integrity(
            item_key,
            format!("Expected {} chunks, but found {}", max + 1, live.len()),
        ));
    }

    for (position, (index, _)) in live.iter().enumerate() {
        if *index as usize != position {
            return Err(CacheError::integrity(
                item_key,
                format!("Missing chunk at index {position}"),
            ));
        }
    }
    Ok(())
}

async fn initialize(weak: Weak<CacheInner>, link: WorkerLink, params: InitParams) {
    let Some((store_path, init_timeout, request_timeout)) = weak.upgrade().map(|inner| {
        (
            inner.config.store_path.clone(),
            inner.config.worker_init_timeout(),
            inner.config.request_timeout(),
        )
    }) else {
        return;
    };

    let started = Instant::now();
    let store = async {
        ChunkStore::open(store_path)
            .await
            .map_err(|e| CacheError::StorageUnavailable(e.to_string()))
    };
    let channel = WorkerChannel::connect(link, params, init_timeout, request_timeout);
    let outcome = tokio::try_join!(store, channel);

    let Some(inner) = weak.upgrade() else {
        return;
    };
    match outcome {
        Ok((store, channel)) => {
            if inner.backend.set(Backend { store, channel }).is_err() {
                warn!("Cache backend initialized twice");
                return;
            }
            let became_ready = inner.state.send_if_modified(|state| {
                if *state == CacheState::Initializing {
                    *state = CacheState::Ready;
                    true
                } else {
                    false
                }
            });
            if became_ready {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Cache ready");
            } else if let Some(backend) = inner.backend.get() {
                backend.channel.shutdown();
            }
        }
        Err(e) => inner.degrade(e),
    }
}

async fn cleanup_timer(
    weak: Weak<CacheInner>,
    mut state: watch::Receiver<CacheState>,
    initial_delay: Duration,
    interval: Duration,
) {
    let ready = matches!(
        state
            .wait_for(|s| !matches!(s, CacheState::Uninitialized | CacheState::Initializing))
            .await
            .map(|s| *s),
        Ok(CacheState::Ready)
    );
    if !ready {
        return;
    }

    tokio::time::sleep(initial_delay).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let cache = SealedCache { inner };
        if cache.state() != CacheState::Ready {
            break;
        }
        cache.scheduled_cleanup().await;
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn log_if_slow(operation: &'static str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_OPERATION {
        debug!(operation, elapsed_ms = elapsed.as_millis() as u64, "Slow cache operation");
    }
}
