//! Chunk layout, byte sources, paced content hashing and transfer statistics.
//!
//! Everything the upload pipeline needs to know about a file's bytes,
//! independent of how they travel to the server.

mod chunked;
mod hashing;
mod progress;
mod source;

pub use chunked::ChunkLayout;
pub use hashing::{HasherPair, PacedHasher, StrongHash, fingerprint_source, weak_fingerprint};
pub use progress::{ChunkStat, OverallStat, Speed, TransferProgress};
pub use source::{ByteSource, FileSource, MemorySource, ReadFuture};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid byte range {start}..{end} for source of {len} bytes")]
    InvalidRange { start: u64, end: u64, len: u64 },

    #[error("cancelled")]
    Cancelled,
}
