//! SQLite-backed ordered chunk store.
//!
//! One table keyed by record key (ordered, so prefix range scans enumerate an
//! item's chunks) plus two secondary indexes: by expiry timestamp and by
//! generation tag. Every call runs inside a single transaction on the blocking
//! pool; writes take the database lock up front (`BEGIN IMMEDIATE`).

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::store::record::{chunk_key_range, ChunkRecord};

/// Bump when the table layout changes; mismatching stores are recreated.
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS chunks (
        key TEXT PRIMARY KEY NOT NULL,
        iv BLOB NOT NULL,
        ciphertext BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        cache_buster TEXT NOT NULL,
        is_last_chunk INTEGER NOT NULL DEFAULT 0
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS chunks_by_timestamp ON chunks(timestamp);
    CREATE INDEX IF NOT EXISTS chunks_by_cache_buster ON chunks(cache_buster);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Storage(err.to_string())
    }
}

/// Which side of the current generation tag to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationRange {
    /// Tags strictly below the current one.
    Below,
    /// Tags strictly above the current one.
    Above,
}

/// Timestamp / generation / last-chunk refresh for an existing record.
#[derive(Debug, Clone)]
pub struct Refresh {
    pub key: String,
    pub timestamp: i64,
    pub cache_buster: String,
    pub is_last_chunk: bool,
}

/// All mutations for one item, applied in one transaction.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub puts: Vec<ChunkRecord>,
    pub refreshes: Vec<Refresh>,
    pub deletes: Vec<String>,
}

/// Handle to the chunk store. Cheap to clone.
#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkStore {
    /// Open (or create) the store at `path`, migrating the schema as needed.
    ///
    /// A file that is not a SQLite database is deleted and recreated.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking({
            let path = path.clone();
            move || open_connection(&path)
        })
        .await??;

        info!(path = %path.display(), "Chunk store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside a read transaction.
    pub async fn read<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let txn = StoreTxn {
                tx: conn.transaction_with_behavior(TransactionBehavior::Deferred)?,
            };
            f(&txn)
        })
        .await?
    }

    /// Run `f` inside a write transaction, committing if it succeeds.
    pub async fn write<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let txn = StoreTxn {
                tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
            };
            let result = f(&txn)?;
            txn.tx.commit()?;
            Ok(result)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    match ensure_schema(&conn) {
        Ok(()) => Ok(conn),
        Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
            if e.code == ErrorCode::NotADatabase =>
        {
            warn!(path = %path.display(), "Store file is not a database, recreating");
            drop(conn);
            std::fs::remove_file(path)?;
            let conn = Connection::open(path)?;
            ensure_schema(&conn)?;
            Ok(conn)
        }
        Err(e) => Err(e),
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != SCHEMA_VERSION {
        if version != 0 {
            warn!(
                found = version,
                expected = SCHEMA_VERSION,
                "Store schema mismatch, recreating chunk table"
            );
        }
        conn.execute_batch("DROP TABLE IF EXISTS chunks;")?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    conn.execute_batch(CREATE_SCHEMA)?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        key: row.get(0)?,
        iv: Bytes::from(row.get::<_, Vec<u8>>(1)?),
        ciphertext: Bytes::from(row.get::<_, Vec<u8>>(2)?),
        timestamp: row.get(3)?,
        cache_buster: row.get(4)?,
        is_last_chunk: row.get(5)?,
    })
}

/// Operations available inside one store transaction.
pub struct StoreTxn<'conn> {
    tx: Transaction<'conn>,
}

impl StoreTxn<'_> {
    /// Keys of every chunk belonging to `base_key`, in key order.
    pub fn chunk_keys(&self, base_key: &str) -> Result<Vec<String>, StoreError> {
        let (lo, hi) = chunk_key_range(base_key);
        let mut stmt = self
            .tx
            .prepare_cached("SELECT key FROM chunks WHERE key >= ?1 AND key <= ?2 ORDER BY key")?;
        let keys = stmt
            .query_map(params![lo, hi], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Every chunk record belonging to `base_key`, in key order.
    pub fn chunk_records(&self, base_key: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let (lo, hi) = chunk_key_range(base_key);
        let mut stmt = self.tx.prepare_cached(
            "SELECT key, iv, ciphertext, timestamp, cache_buster, is_last_chunk
             FROM chunks WHERE key >= ?1 AND key <= ?2 ORDER BY key",
        )?;
        let records = stmt
            .query_map(params![lo, hi], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, key: &str) -> Result<Option<ChunkRecord>, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT key, iv, ciphertext, timestamp, cache_buster, is_last_chunk
             FROM chunks WHERE key = ?1",
        )?;
        Ok(stmt.query_row([key], record_from_row).optional()?)
    }

    /// Insert or replace a record.
    pub fn put(&self, record: &ChunkRecord) -> Result<(), StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "INSERT OR REPLACE INTO chunks (key, iv, ciphertext, timestamp, cache_buster, is_last_chunk)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            record.key,
            record.iv.as_ref(),
            record.ciphertext.as_ref(),
            record.timestamp,
            record.cache_buster,
            record.is_last_chunk,
        ])?;
        Ok(())
    }

    /// Update metadata of an existing record without touching its ciphertext.
    pub fn refresh(&self, refresh: &Refresh) -> Result<bool, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE chunks SET timestamp = ?2, cache_buster = ?3, is_last_chunk = ?4 WHERE key = ?1",
        )?;
        let changed = stmt.execute(params![
            refresh.key,
            refresh.timestamp,
            refresh.cache_buster,
            refresh.is_last_chunk,
        ])?;
        Ok(changed > 0)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut stmt = self.tx.prepare_cached("DELETE FROM chunks WHERE key = ?1")?;
        Ok(stmt.execute([key])? > 0)
    }

    /// Delete every chunk of `base_key`. Returns the number removed.
    pub fn delete_item(&self, base_key: &str) -> Result<usize, StoreError> {
        let (lo, hi) = chunk_key_range(base_key);
        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM chunks WHERE key >= ?1 AND key <= ?2")?;
        Ok(stmt.execute(params![lo, hi])?)
    }

    /// Apply a batch: refreshes, then puts, then deletes.
    pub fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for refresh in &batch.refreshes {
            self.refresh(refresh)?;
        }
        for record in &batch.puts {
            self.put(record)?;
        }
        for key in &batch.deletes {
            self.delete(key)?;
        }
        debug!(
            puts = batch.puts.len(),
            refreshes = batch.refreshes.len(),
            deletes = batch.deletes.len(),
            "Applied write batch"
        );
        Ok(())
    }

    /// Forward scan over the timestamp index, oldest first.
    ///
    /// `visit` sees `(key, timestamp)` and may stop the scan early.
    pub fn scan_by_timestamp<F>(&self, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&str, i64) -> Result<ControlFlow<()>, StoreError>,
    {
        let mut stmt = self
            .tx
            .prepare_cached("SELECT key, timestamp FROM chunks ORDER BY timestamp, key")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let timestamp: i64 = row.get(1)?;
            if visit(&key, timestamp)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Delete every record whose generation tag lies in `range` relative to `current`.
    pub fn delete_generation_range(
        &self,
        current: &str,
        range: GenerationRange,
    ) -> Result<usize, StoreError> {
        let sql = match range {
            GenerationRange::Below => "DELETE FROM chunks WHERE cache_buster < ?1",
            GenerationRange::Above => "DELETE FROM chunks WHERE cache_buster > ?1",
        };
        let mut stmt = self.tx.prepare_cached(sql)?;
        Ok(stmt.execute([current])?)
    }

    /// Total number of chunk records.
    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .tx
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.tx.execute("DELETE FROM chunks", [])?)
    }
}
