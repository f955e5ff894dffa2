pub mod record;
pub mod sqlite;

pub use record::ChunkRecord;
pub use sqlite::{ChunkStore, GenerationRange, Refresh, StoreError, StoreTxn, WriteBatch};
