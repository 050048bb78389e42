use std::ops::Range;
use std::time::Duration;

use futures_util::future::try_join_all;
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use uplink_protocol::strong_chunk_hash;

use crate::{ByteSource, ChunkLayout, TransferError};

// ---------------------------------------------------------------------------
// Weak fingerprints
// ---------------------------------------------------------------------------

/// Computes the hex-encoded MD5 of `data`.
pub fn weak_fingerprint(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes one weak fingerprint per chunk over the chunk's first
/// `prefix` bytes.
///
/// All prefixes are read concurrently; the result is in chunk order.
pub async fn fingerprint_source(
    source: &dyn ByteSource,
    layout: &ChunkLayout,
    prefix: u64,
) -> Result<Vec<String>, TransferError> {
    let reads = (0..layout.count()).map(|index| async move {
        let range = layout.prefix_range(index, prefix);
        let data = source.read_range(range.start, range.end).await?;
        Ok::<_, TransferError>(weak_fingerprint(&data))
    });
    try_join_all(reads).await
}

// ---------------------------------------------------------------------------
// Strong hashes
// ---------------------------------------------------------------------------

/// Hex-encoded MD5 and SHA1 digests of a full chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrongHash {
    pub md5: String,
    pub sha1: String,
}

impl StrongHash {
    /// Wire form sent to the probe endpoint (`"<md5>_<sha1>"`).
    pub fn wire(&self) -> String {
        strong_chunk_hash(&self.md5, &self.sha1)
    }
}

/// Incremental MD5 + SHA1 accumulators fed with the same bytes.
#[derive(Clone, Default)]
pub struct HasherPair {
    md5: Md5,
    sha1: Sha1,
}

impl HasherPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
    }

    pub fn finalize(self) -> StrongHash {
        StrongHash {
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
        }
    }
}

/// Pacing deadline used when a step delay overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Strong chunk hasher whose throughput is paced to a target bit rate.
///
/// A range is hashed in `increment`-sized steps. After each step the
/// hasher sleeps until `start + Σ step_delay`, so hashing many files at
/// once does not saturate the CPU ahead of what the uplink can carry.
#[derive(Debug, Clone, Copy)]
pub struct PacedHasher {
    increment: u64,
    rate_bits_per_ms: f64,
}

impl PacedHasher {
    /// `rate_bits_per_ms <= 0` disables pacing. An `increment` of 0 is treated as 1 MiB.
    pub fn new(increment: u64, rate_bits_per_ms: f64) -> Self {
        let increment = if increment == 0 {
            uplink_protocol::HASH_INCREMENT_LEN
        } else {
            increment
        };
        Self {
            increment,
            rate_bits_per_ms,
        }
    }

    /// Time budget for hashing `bytes` at the configured rate.
    pub fn step_delay(&self, bytes: u64) -> Duration {
        if !self.rate_bits_per_ms.is_finite() || self.rate_bits_per_ms <= 0.0 {
            return Duration::ZERO;
        }
        let millis = bytes as f64 * 8.0 / self.rate_bits_per_ms;
        Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
    }

    /// Hashes `range` of `source`, pacing between increments.
    ///
    /// Cancellation is observed during every pacing sleep.
    pub async fn hash_range(
        &self,
        source: &dyn ByteSource,
        range: Range<u64>,
        cancel: &CancellationToken,
    ) -> Result<StrongHash, TransferError> {
        let mut hasher = HasherPair::new();
        let mut target = Instant::now();
        let mut pos = range.start;

        while pos < range.end {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let end = pos.saturating_add(self.increment).min(range.end);
            let data = source.read_range(pos, end).await?;
            hasher.update(&data);

            let step = self.step_delay(end - pos);
            target = target
                .checked_add(step)
                .or_else(|| target.checked_add(FAR_FUTURE))
                .unwrap_or(target);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep_until(target) => {}
            }
            pos = end;
        }

        let hash = hasher.finalize();
        trace!(start = range.start, end = range.end, md5 = %hash.md5, "chunk hashed");
        Ok(hash)
    }
}
