//! Integration tests for reads, writes and integrity checking.

use rusqlite::Connection;
use tempfile::TempDir;

use sealed_cache::{CacheConfig, CacheError, SealedCache};

fn test_config(dir: &TempDir) -> CacheConfig {
    let mut cfg = CacheConfig::new("test-secret", "v1");
    cfg.store_path = dir.path().join("cache.db");
    cfg.key_derivation_iterations = 1_000;
    cfg.request_timeout_ms = 60_000;
    // Keep the background sweep out of the way.
    cfg.initial_cleanup_delay_ms = 3_600_000;
    cfg
}

fn raw(dir: &TempDir) -> Connection {
    Connection::open(dir.path().join("cache.db")).unwrap()
}

#[tokio::test]
async fn test_set_then_get() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();

    cache.set("greeting", "hello world").await.unwrap();
    assert_eq!(cache.get("greeting").await.unwrap().as_deref(), Some("hello world"));
    assert_eq!(cache.count().await.unwrap(), 1);

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_missing_key_is_none() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();

    assert_eq!(cache.get("nope").await.unwrap(), None);
    cache.remove("nope").await.unwrap();

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_multi_chunk_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 64;
    let cache = SealedCache::new(cfg).unwrap();

    let value: String = (0..5_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    cache.set("big", &value).await.unwrap();

    assert_eq!(cache.count().await.unwrap(), 5_000_u64.div_ceil(64));
    assert_eq!(cache.get("big").await.unwrap(), Some(value));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_round_trip_at_chunk_boundaries() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 64;
    let cache = SealedCache::new(cfg).unwrap();

    let mut expected_total = 0;
    for len in [63_usize, 64, 65, 128] {
        let key = format!("len-{len}");
        let value: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();

        cache.set(&key, &value).await.unwrap();
        expected_total += (len as u64).div_ceil(64);
        assert_eq!(cache.count().await.unwrap(), expected_total, "after storing {len} bytes");
        assert_eq!(cache.get(&key).await.unwrap(), Some(value.clone()));

        // Storing the same value again neither adds nor drops chunks.
        cache.set(&key, &value).await.unwrap();
        assert_eq!(cache.count().await.unwrap(), expected_total, "after rewriting {len} bytes");
        assert_eq!(cache.get(&key).await.unwrap(), Some(value));
    }
    assert_eq!(expected_total, 1 + 1 + 2 + 2);

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_split_multibyte_characters_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 5;
    let cache = SealedCache::new(cfg).unwrap();

    let value = "héllo wörld ✓ ünïcødé 日本語";
    cache.set("utf8", value).await.unwrap();
    assert_eq!(cache.get("utf8").await.unwrap().as_deref(), Some(value));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_empty_value_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();

    cache.set("empty", "").await.unwrap();
    assert_eq!(cache.get("empty").await.unwrap().as_deref(), Some(""));
    assert_eq!(cache.count().await.unwrap(), 1);

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_overwrite_drops_stale_chunks() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 10;
    let cache = SealedCache::new(cfg).unwrap();

    cache.set("item", &"x".repeat(95)).await.unwrap();
    assert_eq!(cache.count().await.unwrap(), 10);

    cache.set("item", "short").await.unwrap();
    assert_eq!(cache.count().await.unwrap(), 1);
    assert_eq!(cache.get("item").await.unwrap().as_deref(), Some("short"));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_unchanged_chunks_are_not_reencrypted() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 4;
    let cache = SealedCache::new(cfg).unwrap();

    cache.set("item", "aaaabbbbcccc").await.unwrap();
    let before: Vec<(String, Vec<u8>, i64)> = {
        let conn = raw(&dir);
        let mut stmt = conn
            .prepare("SELECT key, iv, timestamp FROM chunks ORDER BY key")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    };

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    // First two chunks unchanged, last one new.
    cache.set("item", "aaaabbbbdddd").await.unwrap();

    let conn = raw(&dir);
    for (key, iv, timestamp) in &before[..2] {
        let (new_iv, new_ts): (Vec<u8>, i64) = conn
            .query_row(
                "SELECT iv, timestamp FROM chunks WHERE key = ?1",
                [key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(&new_iv, iv, "unchanged chunk was re-encrypted");
        assert!(new_ts > *timestamp, "unchanged chunk was not refreshed");
    }
    let stale: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks WHERE key = ?1", [&before[2].0], |r| r.get(0))
        .unwrap();
    assert_eq!(stale, 0);
    assert_eq!(cache.get("item").await.unwrap().as_deref(), Some("aaaabbbbdddd"));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_values_persist_across_instances() {
    let dir = TempDir::new().unwrap();

    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("durable", "still here").await.unwrap();
    cache.destroy(false).await.unwrap();

    let cache = SealedCache::new(test_config(&dir)).unwrap();
    assert_eq!(cache.get("durable").await.unwrap().as_deref(), Some("still here"));
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_other_secret_cannot_see_items() {
    let dir = TempDir::new().unwrap();

    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("private", "value").await.unwrap();
    cache.destroy(false).await.unwrap();

    let mut cfg = test_config(&dir);
    cfg.secret = Some("another-secret".to_string());
    let cache = SealedCache::new(cfg).unwrap();
    assert_eq!(cache.get("private").await.unwrap(), None);
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_ciphertext_is_not_plaintext() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("item", "very recognizable plaintext").await.unwrap();

    let ciphertext: Vec<u8> = raw(&dir)
        .query_row("SELECT ciphertext FROM chunks", [], |r| r.get(0))
        .unwrap();
    let needle = b"recognizable";
    assert!(!ciphertext.windows(needle.len()).any(|w| w == needle));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_missing_middle_chunk_is_integrity_error() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 4;
    let cache = SealedCache::new(cfg).unwrap();
    cache.set("item", "aaaabbbbcccc").await.unwrap();

    raw(&dir)
        .execute("DELETE FROM chunks WHERE key LIKE '%-chunk-000001-%'", [])
        .unwrap();

    match cache.get("item").await {
        Err(CacheError::IntegrityViolation { reason, .. }) => {
            assert_eq!(reason, "Expected 3 chunks, but found 2")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_missing_last_chunk_is_integrity_error() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 4;
    let cache = SealedCache::new(cfg).unwrap();
    cache.set("item", "aaaabbbbcccc").await.unwrap();

    raw(&dir)
        .execute("DELETE FROM chunks WHERE is_last_chunk = 1", [])
        .unwrap();

    match cache.get("item").await {
        Err(CacheError::IntegrityViolation { reason, .. }) => {
            assert_eq!(reason, "Last chunk is missing")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_tampered_ciphertext_fails_decryption() {
    let dir = TempDir::new().unwrap();
    let cache = SealedCache::new(test_config(&dir)).unwrap();
    cache.set("item", "payload").await.unwrap();

    raw(&dir)
        .execute("UPDATE chunks SET ciphertext = zeroblob(23)", [])
        .unwrap();

    assert!(matches!(
        cache.get("item").await,
        Err(CacheError::DecryptionFailed(_))
    ));
    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_operations_on_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.chunk_size = 32;
    let cache = SealedCache::new(cfg).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key-{i}");
            let value = format!("{i}").repeat(500);
            cache.set(&key, &value).await.unwrap();
            assert_eq!(cache.get(&key).await.unwrap(), Some(value));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(cache.count().await.unwrap(), 8 * 500_u64.div_ceil(32));

    cache.destroy(false).await.unwrap();
}

#[tokio::test]
async fn test_low_latency_mode_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.low_latency_mode = true;
    cfg.chunk_size = 16;
    let cache = SealedCache::new(cfg).unwrap();

    cache.set("item", &"z".repeat(100)).await.unwrap();
    assert_eq!(cache.get("item").await.unwrap(), Some("z".repeat(100)));
    cache.remove("item").await.unwrap();
    assert_eq!(cache.get("item").await.unwrap(), None);

    cache.destroy(false).await.unwrap();
}
