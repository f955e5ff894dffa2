//! Error taxonomy for the sealed cache.
//!
//! Every public operation returns [`CacheError`]. `StoreError` converts into
//! it through `From`. Cipher failures stay inside the crypto engine and reach
//! the cache as a `CryptoErrorKind` plus message, which the channel maps onto
//! a variant.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::cache::engine::SealedCache`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The persistent store could not be created or opened.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The crypto execution context could not be started.
    #[error("Crypto unavailable: {0}")]
    CryptoUnavailable(String),

    /// The crypto engine failed its handshake or died after startup.
    /// The instance is permanently degraded.
    #[error("Crypto worker initialization failed: {0}")]
    WorkerInitializationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Stored chunks for an item do not form a complete sequence.
    #[error("Integrity check failed for key {key}: {reason}")]
    IntegrityViolation { key: String, reason: String },

    #[error("Cannot store item: chunks needed ({needed}) exceeds limit ({limit})")]
    CapacityExceeded { needed: u64, limit: u64 },

    /// The request was abandoned; the underlying crypto task may still run.
    #[error("Crypto request timed out after {0:?}")]
    RequestTimedOut(Duration),

    #[error("Cache instance has been destroyed")]
    Destroyed,

    /// A per-call store failure after successful startup.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The channel to the crypto engine broke; every pending request fails with this.
    #[error("Crypto worker transport failed: {0}")]
    Transport(String),
}

impl CacheError {
    /// Whether the outcome of the failed operation is unknown rather than "not performed".
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, CacheError::RequestTimedOut(_))
    }

    pub(crate) fn integrity(key: &str, reason: impl Into<String>) -> Self {
        CacheError::IntegrityViolation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
