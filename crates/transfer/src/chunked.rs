use std::ops::Range;

use uplink_protocol::DEFAULT_CHUNK_SIZE;

/// Partition of a file into fixed-size chunks.
///
/// Chunk `i` covers `[i * chunk_size, min(size, (i + 1) * chunk_size))`;
/// only the last chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    size: u64,
    chunk_size: u64,
}

impl ChunkLayout {
    /// Creates a layout for a file of `size` bytes.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] (50 MiB) is used.
    pub fn new(size: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { size, chunk_size }
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks, `ceil(size / chunk_size)`. Zero for an empty file.
    pub fn count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size)
    }

    /// Byte range of chunk `index`. Empty if `index` is past the end.
    pub fn range(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.chunk_size).min(self.size);
        let end = start.saturating_add(self.chunk_size).min(self.size);
        start..end
    }

    /// Leading `prefix` bytes of chunk `index`, clamped to the chunk.
    pub fn prefix_range(&self, index: u64, prefix: u64) -> Range<u64> {
        let range = self.range(index);
        range.start..range.start.saturating_add(prefix).min(range.end)
    }

    /// Bytes covered by chunks `0..first_chunk`, clamped to the file size.
    pub fn skipped_bytes(&self, first_chunk: u64) -> u64 {
        first_chunk.saturating_mul(self.chunk_size).min(self.size)
    }

    /// Returns `true` if `index` is the final chunk.
    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.count()
    }
}
