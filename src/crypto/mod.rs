pub mod cipher;
pub mod engine;
pub mod keys;
pub mod queue;

pub use cipher::{ChunkCipher, EncryptedPayload};
pub use engine::spawn_engine;
pub use keys::{DerivedKey, KeyCache};
pub use queue::AdaptiveQueue;
