//! Chunks: fixed-size content units, and buffers of chunk bytes awaiting verification.

use crate::bin::Bin;

/// Default chunk size in bytes (RFC 7574 §8.1 recommends 1 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

/// Number of chunks needed for `total_len` bytes.
pub fn chunk_count(total_len: u64, chunk_size: u32) -> u64 {
    let size = effective_size(chunk_size) as u64;
    total_len.div_ceil(size)
}

/// Split content into chunks by fixed size; the last chunk may be short.
pub fn split_into_chunks(content: &[u8], chunk_size: u32) -> Vec<&[u8]> {
    content.chunks(effective_size(chunk_size) as usize).collect()
}

/// Split a multi-chunk DATA payload covering `bin` into its leaf chunks.
/// Returns `None` if the payload is longer than the bin can hold.
pub fn split_payload(bin: Bin, payload: &[u8], chunk_size: u32) -> Option<Vec<(Bin, &[u8])>> {
    let size = effective_size(chunk_size) as usize;
    if bin.is_leaf() {
        return (payload.len() <= size).then(|| vec![(bin, payload)]);
    }
    let (first, last) = bin.range();
    let max = (last - first + 1).checked_mul(size as u64)?;
    if payload.len() as u64 > max {
        return None;
    }
    Some(
        payload
            .chunks(size)
            .enumerate()
            .map(|(i, c)| (Bin::chunk(first + i as u64), c))
            .collect(),
    )
}

fn effective_size(chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Raw bytes for one leaf bin. Held by the verifier until a trusted hash
/// confirms them, then handed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBuffer {
    pub bin: Bin,
    pub data: Vec<u8>,
}

impl ChunkBuffer {
    pub fn new(bin: Bin, data: Vec<u8>) -> Self {
        Self { bin, data }
    }

    pub fn index(&self) -> u64 {
        self.bin.base_offset()
    }
}
