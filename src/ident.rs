//! Deterministic identifiers for item base keys and content-addressed chunks.
//!
//! An identifier is the SHA-512 digest of its input, truncated to 16 bytes and
//! shaped as a version-5 / RFC 4122 UUID string. The version and variant bits
//! only give the key space a fixed shape; they carry no security meaning.

use std::num::NonZeroUsize;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use uuid::{Builder, Variant, Version};

/// Capacity of the process-wide identifier memo.
pub const MEMO_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1_000) {
    Some(n) => n,
    None => unreachable!(),
};

static MEMO: Lazy<IdentifierMemo> = Lazy::new(|| IdentifierMemo::new(MEMO_CAPACITY));

/// Bounded LRU memo from input string to identifier.
///
/// Pure performance cache: recomputing an evicted entry yields the same value.
pub struct IdentifierMemo {
    entries: Mutex<LruCache<String, String>>,
}

impl IdentifierMemo {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the memoized identifier for `input`, computing it on a miss.
    pub fn get_or_compute(&self, input: &str) -> String {
        if let Some(id) = self.entries.lock().get(input) {
            return id.clone();
        }
        let id = digest_to_id(Sha512::digest(input.as_bytes()).as_slice());
        self.entries.lock().put(input.to_string(), id.clone());
        id
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn digest_to_id(digest: &[u8]) -> String {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_bytes(bytes)
        .with_version(Version::Sha1)
        .with_variant(Variant::RFC4122)
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// Deterministic identifier for an arbitrary string, memoized process-wide.
pub fn deterministic_id(input: &str) -> String {
    MEMO.get_or_compute(input)
}

/// Base key grouping every chunk record of one logical item.
pub fn base_key(secret: &str, item_key: &str) -> String {
    deterministic_id(&format!("{secret}:{item_key}"))
}

/// Content identifier of one chunk, scoped by secret and generation tag.
///
/// Not memoized: inputs are chunk-sized and rarely repeat.
pub fn content_id(secret: &str, generation_tag: &str, chunk: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(generation_tag.as_bytes());
    hasher.update(b":");
    hasher.update(chunk);
    digest_to_id(hasher.finalize().as_slice())
}
