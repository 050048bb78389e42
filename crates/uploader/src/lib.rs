//! Resumable, content-deduplicating chunked uploads.
//!
//! [`ChunkUploader`] drives a single file through token acquisition,
//! probe negotiation and ordered chunk transfer with retry. [`Uploader`]
//! runs batches of them on a bounded [`uplink_opqueue::OperationQueue`]
//! and reports batch-level events.
//!
//! Network access goes through the [`Transport`] and [`TokenIssuer`]
//! traits so the state machine can be driven without a server.

mod chunked;
pub mod config;
mod error;
mod facade;
mod transport;
mod types;

#[cfg(test)]
mod testing;

pub use chunked::ChunkUploader;
pub use config::{DEFAULT_PACING_RATE, DEFAULT_UPLOAD_CONCURRENCY, RetryConfig, UploaderConfig};
pub use error::{ConfigError, ErrorKind, UploadError};
pub use facade::{Uploader, generate_uploadables, touchables};
pub use transport::{
    HttpRequest, HttpResponse, Method, ProgressFn, TokenIssuer, Transport, TransportFuture,
};
pub use types::{
    Candidate, Step, UploadEvent, UploadOutcome, UploadProgress, Uploadable, UploaderEvent,
};
