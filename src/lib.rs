//! sealed-cache: an encrypted, chunked persistent cache.
//!
//! Values are split into fixed-size chunks, sealed with AES-256-GCM under a
//! key stretched from a caller secret, and persisted in an embedded SQLite
//! store. Items expire, can be invalidated wholesale by changing the
//! generation tag, and are evicted oldest-first under a hard chunk bound.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ident;
pub mod rpc;
pub mod store;

pub use cache::{CacheState, SealedCache, SweepReport};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
