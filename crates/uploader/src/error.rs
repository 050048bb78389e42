//! Upload error types.

use uplink_protocol::ProbeError;
use uplink_transfer::TransferError;

/// Errors produced while uploading a file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("cancelled")]
    Cancelled,

    /// The server already holds every chunk. Not a failure.
    #[error("already fully uploaded")]
    FullyUploaded,

    /// The server-side node changed incompatibly. Never retried.
    #[error("conflict: server-side node changed")]
    Conflict,

    #[error("token request failed: {0}")]
    Token(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}")]
    Status { status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("hashing task failed: {0}")]
    Hashing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(TransferError),
}

impl From<TransferError> for UploadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Self::Cancelled,
            other => Self::Transfer(other),
        }
    }
}

/// Coarse classification of an [`UploadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller requested abort.
    Cancelled,
    /// Nothing to send.
    FullyUploaded,
    /// HTTP 409 from the pipe endpoint.
    Conflict,
    /// Anything else: network, status, protocol or I/O.
    Technical,
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::FullyUploaded => ErrorKind::FullyUploaded,
            Self::Conflict => ErrorKind::Conflict,
            _ => ErrorKind::Technical,
        }
    }
}

/// Errors loading an [`UploaderConfig`](crate::UploaderConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(UploadError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(UploadError::Conflict.kind(), ErrorKind::Conflict);
        assert_eq!(
            UploadError::Status { status: 503 }.kind(),
            ErrorKind::Technical
        );
        assert_eq!(UploadError::FullyUploaded.kind(), ErrorKind::FullyUploaded);
        assert_eq!(
            UploadError::Transport("reset".into()).kind(),
            ErrorKind::Technical
        );
    }

    #[test]
    fn cancelled_transfer_maps_to_cancelled() {
        let err: UploadError = TransferError::Cancelled.into();
        assert!(matches!(err, UploadError::Cancelled));

        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: UploadError = TransferError::Io(io).into();
        assert_eq!(err.kind(), ErrorKind::Technical);
    }
}
