//! Splitting item values into fixed-size chunks.
//!
//! Values are split on byte boundaries of their UTF-8 encoding. An empty value
//! still produces one (empty) chunk so that every stored item has a last chunk.

use std::ops::Range;

use crate::ident::content_id;
use crate::store::record::chunk_key;

/// Number of chunks a value of `len` bytes occupies.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size)
    }
}

/// One planned chunk of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u32,
    /// Content-addressed record key.
    pub key: String,
    /// Byte range within the value.
    pub range: Range<usize>,
    pub is_last: bool,
}

/// Plan the chunk records for `value`.
///
/// The caller checks the chunk count against the index limit beforehand.
pub fn plan_chunks(
    secret: &str,
    generation_tag: &str,
    base_key: &str,
    value: &[u8],
    chunk_size: usize,
) -> Vec<ChunkPlan> {
    let count = chunk_count(value.len(), chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(value.len());
            let index = i as u32;
            ChunkPlan {
                index,
                key: chunk_key(
                    base_key,
                    index,
                    &content_id(secret, generation_tag, &value[start..end]),
                ),
                range: start..end,
                is_last: i + 1 == count,
            }
        })
        .collect()
}
