//! Uploader configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! overrides:
//!
//! ```toml
//! concurrency = 2
//!
//! [retry]
//! initial_delay = 5.0
//! max_attempts = 20
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uplink_protocol::{DEFAULT_CHUNK_SIZE, FINGERPRINT_PREFIX_LEN, HASH_INCREMENT_LEN};

use crate::error::ConfigError;

/// Target hashing rate in bits per millisecond (100 Mbit/s).
pub const DEFAULT_PACING_RATE: f64 = 100_000.0;

/// Number of files uploaded at once by the batch facade.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// Tunables for chunked uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Bytes per transfer chunk.
    pub chunk_size: u64,
    /// Leading bytes of each chunk covered by its weak fingerprint.
    pub fingerprint_prefix: u64,
    /// Step size of paced strong hashing.
    pub hash_increment: u64,
    /// Strong hashing target rate in bits per millisecond. `0` disables pacing.
    pub pacing_rate: f64,
    /// Files uploaded concurrently by [`Uploader`](crate::Uploader).
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fingerprint_prefix: FINGERPRINT_PREFIX_LEN,
            hash_increment: HASH_INCREMENT_LEN,
            pacing_rate: DEFAULT_PACING_RATE,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

impl UploaderConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "uploader configuration loaded");
        Ok(config)
    }

    /// Serializes to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Backoff policy for failed chunk transfers.
///
/// Delays are given in seconds in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry of a chunk.
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt. Values below 1 are treated as 1.
    pub backoff_factor: f64,
    /// Attempts per chunk before giving up. `None` retries until cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(320),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_factor.max(1.0);
        let secs = self.initial_delay.as_secs_f64() * factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Serde module for a `Duration` written as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| de::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
