//! The cache orchestrator and its helpers.
//!
//! - [`engine`]: `SealedCache`, the public get/set/remove/cleanup surface
//! - [`chunker`]: splitting values into content-addressed chunks
//! - [`evictor`]: expiry, generation and capacity sweeps

pub mod chunker;
pub mod engine;
pub mod evictor;

pub use engine::{CacheState, SealedCache};
pub use evictor::SweepReport;
