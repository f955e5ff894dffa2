//! Key stretching and the derived-key cache.
//!
//! The AES-256 key is stretched from the secret with PBKDF2-HMAC-SHA512, salted
//! by the generation tag. Derivation is deliberately slow, so results are kept
//! in a small LRU keyed by a fingerprint of `(secret, salt)` rather than the raw
//! secret.

use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// How many derived keys one engine keeps.
pub const KEY_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(n) => n,
    None => unreachable!(),
};

/// A derived AES-256 key. Wiped from memory on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Stretch `secret` into an AES-256 key.
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u32) -> DerivedKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(secret, salt, iterations, &mut key);
    let derived = DerivedKey(key);
    key.zeroize();
    derived
}

type Fingerprint = [u8; 32];

fn fingerprint(secret: &[u8], salt: &[u8], iterations: u32) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update((secret.len() as u64).to_le_bytes());
    hasher.update(secret);
    hasher.update((salt.len() as u64).to_le_bytes());
    hasher.update(salt);
    hasher.update(iterations.to_le_bytes());
    hasher.finalize().into()
}

/// Bounded cache of derived keys.
pub struct KeyCache {
    entries: LruCache<Fingerprint, DerivedKey>,
    hits: u64,
    misses: u64,
}

impl KeyCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Return the cached key for `(secret, salt, iterations)`, deriving on a miss.
    pub fn get_or_derive(&mut self, secret: &[u8], salt: &[u8], iterations: u32) -> DerivedKey {
        let fp = fingerprint(secret, salt, iterations);
        if let Some(key) = self.entries.get(&fp) {
            self.hits += 1;
            return key.clone();
        }
        self.misses += 1;
        let key = derive_key(secret, salt, iterations);
        self.entries.put(fp, key.clone());
        key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Drop every cached key.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(KEY_CACHE_CAPACITY)
    }
}
