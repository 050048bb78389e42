//! Data types for the upload flow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uplink_opqueue::ReferenceId;
use uplink_transfer::{ByteSource, TransferProgress};

use crate::error::UploadError;

/// A file ready to upload into a reserved server-side node.
#[derive(Clone)]
pub struct Uploadable {
    pub node_id: String,
    pub name: String,
    pub full_path: String,
    /// Total size in bytes.
    pub size: u64,
    pub mime: String,
    pub ext: String,
    pub source: Arc<dyn ByteSource>,
    /// Upload token from the reservation. Requested on demand when absent.
    pub token: Option<String>,
}

impl fmt::Debug for Uploadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploadable")
            .field("node_id", &self.node_id)
            .field("name", &self.name)
            .field("full_path", &self.full_path)
            .field("size", &self.size)
            .field("mime", &self.mime)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

/// A recognized local file that has not been reserved on the server yet.
#[derive(Clone)]
pub struct Candidate {
    /// Correlates the file with its reservation entry.
    pub lookup_key: String,
    pub name: String,
    /// Path including the file name, e.g. `/photos/2024/a.jpg`.
    pub full_path: String,
    pub mime: String,
    pub ext: String,
    pub source: Arc<dyn ByteSource>,
}

impl Candidate {
    /// Creates a candidate with a fresh random lookup key.
    pub fn new(
        name: impl Into<String>,
        full_path: impl Into<String>,
        mime: impl Into<String>,
        ext: impl Into<String>,
        source: Arc<dyn ByteSource>,
    ) -> Self {
        Self {
            lookup_key: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            full_path: full_path.into(),
            mime: mime.into(),
            ext: ext.into(),
            source,
        }
    }

    pub fn size(&self) -> u64 {
        self.source.len()
    }

    /// Directory part of `full_path`, keeping the trailing separator.
    pub fn parent_path(&self) -> &str {
        self.full_path
            .strip_suffix(self.name.as_str())
            .unwrap_or(&self.full_path)
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("lookup_key", &self.lookup_key)
            .field("full_path", &self.full_path)
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

/// Lifecycle step of a [`ChunkUploader`](crate::ChunkUploader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Waiting,
    Preparing,
    Probing,
    Uploading,
    Retrying,
    Cancelling,
    Done,
    Failed,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Preparing => "preparing",
            Self::Probing => "probing",
            Self::Uploading => "uploading",
            Self::Retrying => "retrying",
            Self::Cancelling => "cancelling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every remaining chunk was stored.
    Uploaded,
    /// The probe found the content already complete on the server.
    AlreadyUploaded,
    Cancelled,
    /// The pipe endpoint answered 409.
    Conflict,
    /// Technical failure, with its description.
    Failed(String),
}

impl UploadOutcome {
    /// Returns `true` if the file is complete on the server.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Uploaded | Self::AlreadyUploaded)
    }

    /// The step a finished uploader rests in.
    pub fn final_step(&self) -> Step {
        match self {
            Self::Uploaded | Self::AlreadyUploaded => Step::Done,
            Self::Cancelled => Step::Cancelling,
            Self::Conflict | Self::Failed(_) => Step::Failed,
        }
    }
}

impl From<UploadError> for UploadOutcome {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Cancelled => Self::Cancelled,
            UploadError::FullyUploaded => Self::AlreadyUploaded,
            UploadError::Conflict => Self::Conflict,
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Point-in-time progress of one upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    pub step: Step,
    /// When the pending retry fires. Only set while `step` is `Retrying`.
    pub retry_at: Option<Instant>,
    pub transfer: TransferProgress,
}

/// Lifecycle events of a single [`ChunkUploader`](crate::ChunkUploader).
///
/// `id` is the uploader's queue reference.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    ProbeStarted {
        id: ReferenceId,
        node_id: String,
    },
    ProbeEnded {
        id: ReferenceId,
        node_id: String,
    },
    UploadStarted {
        id: ReferenceId,
        node_id: String,
        first_chunk: u64,
        chunks: u64,
    },
    ChunkStarted {
        id: ReferenceId,
        node_id: String,
        index: u64,
        progress: UploadProgress,
    },
    ChunkProgress {
        id: ReferenceId,
        node_id: String,
        index: u64,
        progress: UploadProgress,
    },
    ChunkEnded {
        id: ReferenceId,
        node_id: String,
        index: u64,
        progress: UploadProgress,
    },
    Retrying {
        id: ReferenceId,
        node_id: String,
        index: u64,
        attempt: u32,
        delay: Duration,
    },
    UploadEnded {
        id: ReferenceId,
        node_id: String,
        outcome: UploadOutcome,
    },
}

/// Batch-level events emitted by the [`Uploader`](crate::Uploader) facade.
#[derive(Debug, Clone)]
pub enum UploaderEvent {
    /// A batch was queued.
    Enqueued { count: usize, size: u64 },
    PreparingFile {
        reference: ReferenceId,
        node_id: String,
    },
    PreparedFile {
        reference: ReferenceId,
        node_id: String,
    },
    UploadingFile {
        reference: ReferenceId,
        node_id: String,
    },
    FileProgress {
        reference: ReferenceId,
        node_id: String,
        progress: UploadProgress,
    },
    Retrying {
        reference: ReferenceId,
        node_id: String,
        attempt: u32,
        delay: Duration,
    },
    FileFinished {
        reference: ReferenceId,
        node_id: String,
        outcome: UploadOutcome,
    },
    /// Nothing left waiting or running.
    Idle,
}

impl From<UploadEvent> for UploaderEvent {
    fn from(event: UploadEvent) -> Self {
        match event {
            UploadEvent::ProbeStarted { id, node_id } => Self::PreparingFile {
                reference: id,
                node_id,
            },
            UploadEvent::ProbeEnded { id, node_id } => Self::PreparedFile {
                reference: id,
                node_id,
            },
            UploadEvent::UploadStarted { id, node_id, .. } => Self::UploadingFile {
                reference: id,
                node_id,
            },
            UploadEvent::ChunkStarted {
                id,
                node_id,
                progress,
                ..
            }
            | UploadEvent::ChunkProgress {
                id,
                node_id,
                progress,
                ..
            }
            | UploadEvent::ChunkEnded {
                id,
                node_id,
                progress,
                ..
            } => Self::FileProgress {
                reference: id,
                node_id,
                progress,
            },
            UploadEvent::Retrying {
                id,
                node_id,
                attempt,
                delay,
                ..
            } => Self::Retrying {
                reference: id,
                node_id,
                attempt,
                delay,
            },
            UploadEvent::UploadEnded {
                id,
                node_id,
                outcome,
            } => Self::FileFinished {
                reference: id,
                node_id,
                outcome,
            },
        }
    }
}
