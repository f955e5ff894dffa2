//! Lifecycle tests: startup, degradation and teardown.

use std::time::Duration;

use tempfile::TempDir;

use sealed_cache::{CacheConfig, CacheError, CacheState, SealedCache};

fn test_config(dir: &TempDir) -> CacheConfig {
    let mut cfg = CacheConfig::new("test-secret", "v1");
    cfg.store_path = dir.path().join("cache.db");
    cfg.key_derivation_iterations = 1_000;
    cfg.request_timeout_ms = 60_000;
    cfg.initial_cleanup_delay_ms = 3_600_000;
    cfg
}

#[tokio::test]
async fn test_becomes_ready() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    assert_eq!(cache.state(), CacheState::Initializing);

    // Any operation waits for initialization.
    assert_eq!(cache.count().await.unwrap(), 0);
    assert_eq!(cache.state(), CacheState::Ready);

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_missing_secret_fails_construction() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.secret = None;
    assert!(matches!(
        SealedCache::new(cfg),
        Err(CacheError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_unusable_store_location_fails_construction() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let mut cfg = test_config(&dir);
    cfg.store_path = blocker.join("cache.db");
    assert!(matches!(
        SealedCache::new(cfg),
        Err(CacheError::StorageUnavailable(_))
    ));
}

#[tokio::test]
async fn test_handshake_timeout_degrades_instance() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    // Derivation cannot finish within the handshake window.
    cfg.key_derivation_iterations = 2_000_000;
    cfg.worker_init_timeout_ms = 1;
    let cache = SealedCache::new(cfg).unwrap();

    // Reads report absent, everything else fails fast.
    assert_eq!(cache.get("item").await.unwrap(), None);
    assert_eq!(cache.state(), CacheState::Degraded);
    assert!(matches!(
        cache.set("item", "value").await,
        Err(CacheError::WorkerInitializationFailed(_))
    ));
    assert!(matches!(
        cache.count().await,
        Err(CacheError::WorkerInitializationFailed(_))
    ));

    cache.destroy(false).await.unwrap();
    assert_eq!(cache.state(), CacheState::Destroyed);
}

#[tokio::test]
async fn test_operations_after_destroy_fail() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("item", "value").await.unwrap();

    cache.destroy(false).await.unwrap();
    assert_eq!(cache.state(), CacheState::Destroyed);
    assert_eq!(cache.get("item").await, Err(CacheError::Destroyed));
    assert_eq!(cache.set("item", "v").await, Err(CacheError::Destroyed));
    assert_eq!(cache.count().await, Err(CacheError::Destroyed));

    // Idempotent.
    cache.destroy(true).await.unwrap();
}

#[tokio::test]
async fn test_destroy_with_clear_empties_store() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("item", "value").await.unwrap();
    cache.destroy(true).await.unwrap();

    let cache = SealedCache::new(test_config(&dir)).unwrap();
    assert_eq!(cache.count().await.unwrap(), 0);
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_destroy_during_initialization() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.key_derivation_iterations = 200_000;
    let cache = SealedCache::new(cfg).unwrap();

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("item").await }
    });
    cache.destroy(false).await.unwrap();

    assert_eq!(pending.await.unwrap(), Err(CacheError::Destroyed));
    assert_eq!(cache.state(), CacheState::Destroyed);
}

#[tokio::test]
async fn test_destroy_settles_in_flight_writes() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 64;
    let cache = SealedCache::new(cfg).unwrap();
    cache.count().await.unwrap();

    let write = tokio::spawn({
        let cache = cache.clone();
        async move { cache.set("big", &"q".repeat(256 * 1024)).await }
    });
    tokio::task::yield_now().await;
    cache.destroy(false).await.unwrap();

    // The write either won the race or was rejected; it never hangs.
    let outcome = tokio::time::timeout(Duration::from_secs(10), write)
        .await
        .expect("write hung after destroy")
        .unwrap();
    match outcome {
        Ok(()) | Err(CacheError::Destroyed) | Err(CacheError::Transport(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    for i in 0..5 {
        cache.set(&format!("k{i}"), "value").await.unwrap();
    }
    assert_eq!(cache.count().await.unwrap(), 5);

    cache.clear().await.unwrap();
    assert_eq!(cache.count().await.unwrap(), 0);

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_dropping_last_handle_releases_store() {
    let dir = TempDir::new().unwrap();
    {
        let cache = SealedCache::new(test_config(&dir)).unwrap();
        cache.set("item", "value").await.unwrap();
    }

    let cache = SealedCache::new(test_config(&dir)).unwrap();
    assert_eq!(cache.get("item").await.unwrap().as_deref(), Some("value"));
    cache.destroy(false).await.unwrap();
}
