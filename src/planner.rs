use std::cmp::min;

/// How a byte range is cut into paced chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub chunk_size: u64,
    pub chunk_count: u64,
}

impl TransferPlan {
    /// Plan a transfer of `range_len` bytes with the configured chunk size.
    ///
    /// The chunk is clamped to the range so a tiny request never allocates a
    /// full-rate chunk buffer. The last chunk carries whatever remains.
    pub fn new(range_len: u64, configured_chunk: u64) -> Self {
        if range_len == 0 {
            return Self {
                chunk_size: configured_chunk.max(1),
                chunk_count: 0,
            };
        }
        let chunk_size = min(configured_chunk.max(1), range_len);
        Self {
            chunk_size,
            chunk_count: range_len.div_ceil(chunk_size),
        }
    }

    /// Length of chunk `idx` within a range of `range_len` bytes.
    pub fn chunk_len(&self, idx: u64, range_len: u64) -> u64 {
        let offset = idx * self.chunk_size;
        min(self.chunk_size, range_len.saturating_sub(offset))
    }
}
