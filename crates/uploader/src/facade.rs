//! Batch upload facade.
//!
//! Turns reserved files into [`ChunkUploader`]s on a shared
//! [`OperationQueue`] and rebroadcasts their lifecycle as batch-level
//! [`UploaderEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use uplink_opqueue::{Operation, OperationQueue, QueueEvent, QueueSnapshot, ReferenceId};
use uplink_protocol::constants::TOUCH_TYPE_FILE;
use uplink_protocol::{TouchEntry, Touchable};

use crate::chunked::ChunkUploader;
use crate::config::UploaderConfig;
use crate::transport::{TokenIssuer, Transport};
use crate::types::{Candidate, UploadEvent, UploadOutcome, UploadProgress, Uploadable, UploaderEvent};

type Registry = Arc<Mutex<HashMap<ReferenceId, Arc<ChunkUploader>>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ReferenceId, Arc<ChunkUploader>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Uploads batches of files through a bounded queue.
///
/// Events are buffered up to 256 and dropped (with a trace log) when the
/// receiver falls further behind, so a slow consumer never stalls uploads.
pub struct Uploader {
    config: UploaderConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenIssuer>,
    queue: OperationQueue,
    uploaders: Registry,
    upload_tx: mpsc::Sender<UploadEvent>,
    events_tx: mpsc::Sender<UploaderEvent>,
    events_rx: Option<mpsc::Receiver<UploaderEvent>>,
    forwarder: JoinHandle<()>,
}

impl Uploader {
    /// Creates a facade running `config.concurrency` uploads at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: UploaderConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        let queue = OperationQueue::with_concurrency(config.concurrency);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (upload_tx, upload_rx) = mpsc::channel(256);
        let uploaders: Registry = Arc::new(Mutex::new(HashMap::new()));

        let queue_rx = queue.take_events().unwrap_or_else(|| mpsc::channel(1).1);
        let forwarder = tokio::spawn(forward_events(
            upload_rx,
            queue_rx,
            events_tx.clone(),
            Arc::clone(&uploaders),
        ));

        Self {
            config,
            transport,
            tokens,
            queue,
            uploaders,
            upload_tx,
            events_tx,
            events_rx: Some(events_rx),
            forwarder,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploaderEvent>> {
        self.events_rx.take()
    }

    /// Queues `uploadables`, smallest first.
    ///
    /// Emits [`UploaderEvent::Enqueued`] for the batch and returns the
    /// queue references in upload order.
    pub fn enqueue(&self, mut uploadables: Vec<Uploadable>) -> Vec<ReferenceId> {
        uploadables.sort_by_key(|u| u.size);
        let count = uploadables.len();
        let size: u64 = uploadables.iter().map(|u| u.size).sum();
        info!(count, size, "uploads enqueued");
        self.publish(UploaderEvent::Enqueued { count, size });

        uploadables
            .into_iter()
            .map(|uploadable| {
                self.queue.enqueue_with(|reference| {
                    let uploader = Arc::new(
                        ChunkUploader::new(
                            reference,
                            uploadable,
                            self.config.clone(),
                            Arc::clone(&self.transport),
                            Arc::clone(&self.tokens),
                        )
                        .with_events(self.upload_tx.clone()),
                    );
                    lock(&self.uploaders).insert(reference, Arc::clone(&uploader));
                    uploader as Arc<dyn Operation>
                })
            })
            .collect()
    }

    /// Cancels an upload by queue reference.
    ///
    /// A waiting upload is removed from the queue and reported finished
    /// as cancelled; a running one is cancelled at its next checkpoint.
    /// Returns `false` for unknown or already finished references.
    pub fn cancel(&self, reference: ReferenceId) -> bool {
        let uploader = lock(&self.uploaders).get(&reference).cloned();
        let Some(uploader) = uploader else {
            return false;
        };

        uploader.cancel();
        // Published from the removal hook so it precedes any idle event
        // the removal causes.
        self.queue.cancel_waiting_with(reference, |_| {
            lock(&self.uploaders).remove(&reference);
            debug!(reference, "waiting upload removed");
            self.publish(UploaderEvent::FileFinished {
                reference,
                node_id: uploader.uploadable().node_id.clone(),
                outcome: UploadOutcome::Cancelled,
            });
        });
        true
    }

    /// Cancels every upload that has not finished.
    pub fn cancel_all(&self) {
        let references: Vec<ReferenceId> = lock(&self.uploaders).keys().copied().collect();
        for reference in references {
            self.cancel(reference);
        }
    }

    /// The uploader behind `reference`, while it has not finished.
    pub fn uploader(&self, reference: ReferenceId) -> Option<Arc<ChunkUploader>> {
        lock(&self.uploaders).get(&reference).cloned()
    }

    pub fn progress(&self, reference: ReferenceId) -> Option<UploadProgress> {
        self.uploader(reference).map(|u| u.progress())
    }

    /// Raises the number of concurrent uploads. Never lowers it.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.queue.set_concurrency(concurrency);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Resolves once nothing is waiting or running.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    fn publish(&self, event: UploaderEvent) {
        if self.events_tx.try_send(event).is_err() {
            trace!("uploader event dropped");
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Maps per-file events to batch events until both sources close.
///
/// Per-file events are drained first so a file's `FileFinished` is always
/// published before the `Idle` its completion caused.
async fn forward_events(
    mut upload_rx: mpsc::Receiver<UploadEvent>,
    mut queue_rx: mpsc::Receiver<QueueEvent>,
    events_tx: mpsc::Sender<UploaderEvent>,
    uploaders: Registry,
) {
    loop {
        let event = tokio::select! {
            biased;
            Some(event) = upload_rx.recv() => {
                if let UploadEvent::UploadEnded { id, .. } = &event {
                    lock(&uploaders).remove(id);
                }
                UploaderEvent::from(event)
            }
            Some(QueueEvent::Idle) = queue_rx.recv() => UploaderEvent::Idle,
            else => break,
        };
        if events_tx.try_send(event).is_err() {
            trace!("uploader event dropped");
        }
    }
    debug!("uploader event forwarding stopped");
}

// ---------------------------------------------------------------------------
// Reservation helpers
// ---------------------------------------------------------------------------

/// Builds the reservation ("touch") request entries for `candidates`.
///
/// With `omit_paths`, entries carry no parent path and the files land
/// flat in the target node.
pub fn touchables(candidates: &[Candidate], omit_paths: bool) -> Vec<Touchable> {
    candidates
        .iter()
        .map(|c| Touchable {
            lookup_key: c.lookup_key.clone(),
            name: c.name.clone(),
            mime: c.mime.clone(),
            size: c.size(),
            path: (!omit_paths).then(|| c.parent_path().to_string()),
        })
        .collect()
}

/// Joins reserved nodes with their candidates by lookup key.
///
/// Only entries of type `file` become uploadables; candidates without a
/// reservation are skipped.
pub fn generate_uploadables(
    candidates: &[Candidate],
    touched: &HashMap<String, TouchEntry>,
) -> Vec<Uploadable> {
    candidates
        .iter()
        .filter_map(|c| {
            let Some(entry) = touched.get(&c.lookup_key) else {
                warn!(lookup_key = %c.lookup_key, path = %c.full_path, "candidate was not reserved");
                return None;
            };
            if entry.node_type != TOUCH_TYPE_FILE {
                return None;
            }
            Some(Uploadable {
                node_id: entry.id.clone(),
                name: c.name.clone(),
                full_path: c.full_path.clone(),
                size: c.size(),
                mime: c.mime.clone(),
                ext: c.ext.clone(),
                source: Arc::clone(&c.source),
                token: entry.upload_token.clone(),
            })
        })
        .collect()
}
