//! Chunk record type and the persisted key format.
//!
//! A record key is `<baseKey>-chunk-<6-digit index>-<contentId>`. All chunks of
//! one item share the base-key prefix, so a single ordered range scan over
//! `[<base>-chunk-000000-, <base>-chunk-999999\u{ffff}]` enumerates them.

use bytes::Bytes;

const CHUNK_MARKER: &str = "-chunk-";

/// Largest index representable in the six-digit key segment.
pub const MAX_CHUNK_INDEX: u32 = 999_999;

/// One encrypted chunk as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Full record key.
    pub key: String,

    /// AES-GCM nonce used for this ciphertext.
    pub iv: Bytes,

    /// Ciphertext including the authentication tag.
    pub ciphertext: Bytes,

    /// Absolute expiry instant, epoch milliseconds.
    pub timestamp: i64,

    /// Generation tag active when the record was written or refreshed.
    pub cache_buster: String,

    /// True for the highest-index chunk of the write that produced it.
    pub is_last_chunk: bool,
}

impl ChunkRecord {
    /// Chunk index parsed from the key, if the key is well formed.
    pub fn index(&self) -> Option<u32> {
        parse_chunk_index(&self.key)
    }

    /// `timestamp <= now`: the single expiry predicate shared by reads and sweeps.
    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self.timestamp, now)
    }
}

/// Expiry predicate.
pub fn is_expired(timestamp: i64, now: i64) -> bool {
    timestamp <= now
}

/// Build a record key.
pub fn chunk_key(base_key: &str, index: u32, content_id: &str) -> String {
    format!("{base_key}{CHUNK_MARKER}{index:06}-{content_id}")
}

/// Inclusive key range covering every chunk of `base_key`.
pub fn chunk_key_range(base_key: &str) -> (String, String) {
    (
        format!("{base_key}{CHUNK_MARKER}000000-"),
        format!("{base_key}{CHUNK_MARKER}{MAX_CHUNK_INDEX}\u{ffff}"),
    )
}

/// Parse the chunk index out of a record key.
pub fn parse_chunk_index(key: &str) -> Option<u32> {
    let (_, rest) = key.split_once(CHUNK_MARKER)?;
    let digits = rest.split('-').next()?;
    if digits.len() != 6 {
        return None;
    }
    digits.parse().ok()
}

/// Base key prefix of a record key.
pub fn base_key_of(key: &str) -> Option<&str> {
    let (base, rest) = key.split_once(CHUNK_MARKER)?;
    parse_chunk_index(key)?;
    if rest.len() <= 7 {
        return None;
    }
    Some(base)
}
