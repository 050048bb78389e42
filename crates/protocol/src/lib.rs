//! Wire protocol types for the chunked upload endpoints.
//!
//! Covers the probe negotiation (weak fingerprints plus strong chunk
//! hashes), the per-chunk pipe endpoint, upload token issuance, and the
//! node reservation ("touch") response shape.

pub mod constants;
pub mod messages;
pub mod probe;

// Re-export primary types for convenience.
pub use constants::{
    DEFAULT_CHUNK_SIZE, FINGERPRINT_PREFIX_LEN, HASH_INCREMENT_LEN, STATUS_CONFLICT, STATUS_STORED,
};
pub use messages::{LicenseRequest, LicenseResponse, TouchEntry, Touchable};
pub use probe::{ProbeDecision, ProbeError, ProbeRequest, ProbeResponse, strong_chunk_hash};
