use std::time::Duration;

use tokio::time::Instant;

/// Rolling statistics for the chunk currently in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkStat {
    /// When the transfer of this chunk started.
    pub started_at: Instant,
    pub elapsed: Duration,
    /// Bytes of this chunk acknowledged by the transport so far.
    pub bytes: u64,
    pub bytes_per_sec: f64,
    pub bits_per_sec: f64,
}

impl ChunkStat {
    /// A stat with nothing transferred yet.
    pub fn idle(now: Instant) -> Self {
        Self {
            started_at: now,
            elapsed: Duration::ZERO,
            bytes: 0,
            bytes_per_sec: 0.0,
            bits_per_sec: 0.0,
        }
    }

    /// Measures `bytes` sent between `started_at` and `now`.
    ///
    /// Rates are NaN when no time has elapsed.
    pub fn measure(started_at: Instant, bytes: u64, now: Instant) -> Self {
        let elapsed = now.saturating_duration_since(started_at);
        let bytes_per_sec = rate(bytes, elapsed);
        Self {
            started_at,
            elapsed,
            bytes,
            bytes_per_sec,
            bits_per_sec: bytes_per_sec * 8.0,
        }
    }
}

/// Statistics accumulated over completed chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverallStat {
    pub chunks_done: u64,
    pub elapsed: Duration,
    pub bytes_sent: u64,
    /// Bytes the server already had (before the resume point).
    pub bytes_skipped: u64,
}

impl OverallStat {
    /// Folds a completed chunk into the totals.
    pub fn fold(&mut self, chunk: &ChunkStat) {
        self.chunks_done += 1;
        self.elapsed += chunk.elapsed;
        self.bytes_sent += chunk.bytes;
    }
}

/// Transfer speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed {
    pub bytes_per_sec: f64,
    pub bits_per_sec: f64,
}

/// Point-in-time view combining current and overall statistics.
///
/// Percentages are fractions in `[0, 1]`. Quantities that would divide
/// by zero are NaN (rates, fractions) or `None` (remaining time).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub speed: Speed,
    pub total_size: u64,
    pub skip_size: u64,
    /// `total_size - skip_size`.
    pub uploadable_size: u64,
    pub uploaded_size: u64,
    pub remaining_size: u64,
    pub elapsed_time: Duration,
    pub remaining_time: Option<Duration>,
    pub skip_percent: f64,
    pub uploaded_percent: f64,
}

impl TransferProgress {
    pub fn compute(total_size: u64, current: &ChunkStat, overall: &OverallStat) -> Self {
        let skip_size = overall.bytes_skipped;
        let uploadable_size = total_size.saturating_sub(skip_size);
        let uploaded_size = overall.bytes_sent + current.bytes;
        let remaining_size = uploadable_size.saturating_sub(uploaded_size);
        let elapsed_time = overall.elapsed + current.elapsed;

        let bytes_per_sec = rate(uploaded_size, elapsed_time);
        let remaining_time = if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
            Some(Duration::from_secs_f64(remaining_size as f64 / bytes_per_sec))
        } else {
            None
        };

        Self {
            speed: Speed {
                bytes_per_sec,
                bits_per_sec: bytes_per_sec * 8.0,
            },
            total_size,
            skip_size,
            uploadable_size,
            uploaded_size,
            remaining_size,
            elapsed_time,
            remaining_time,
            skip_percent: fraction(skip_size, total_size),
            uploaded_percent: fraction(uploaded_size, total_size),
        }
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return f64::NAN;
    }
    bytes as f64 / elapsed.as_secs_f64()
}

fn fraction(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return f64::NAN;
    }
    part as f64 / whole as f64
}
