//! HTTP client for the chunked upload endpoints.
//!
//! [`PlatformClient`] implements both capabilities the uploader needs:
//! [`Transport`](uplink_uploader::Transport) over `reqwest`, streaming
//! request bodies so send progress can be reported, and
//! [`TokenIssuer`](uplink_uploader::TokenIssuer) against the license
//! endpoint.

mod client;
mod config;

pub use client::{PROGRESS_SLICE, PlatformClient, PlatformError};
pub use config::{DEFAULT_API_URL, PlatformConfig};
