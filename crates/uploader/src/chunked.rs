//! Per-file upload state machine.
//!
//! A [`ChunkUploader`] walks one file through
//! `Waiting → Preparing → Probing → Uploading ⇄ Retrying → Done`.
//! Probing sends every weak fingerprint up front and answers the server's
//! requests for strong chunk hashes until it either recognizes the whole
//! file or names the chunk to resume at. Chunks are then sent one at a
//! time, in order; technical failures are retried with exponential
//! backoff, a 409 ends the upload.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use uplink_opqueue::{Operation, OperationFuture, ReferenceId};
use uplink_protocol::constants::{
    CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, HEADER_CHUNK_SIZE, HEADER_CONTENT_TYPE,
    HEADER_UPLOAD_CONTENT_LENGTH, HEADER_UPLOAD_CONTENT_TYPE, NO_STORE_HEADERS, QUERY_TOKEN,
    pipe_path, probe_path,
};
use uplink_protocol::{ProbeDecision, ProbeRequest, ProbeResponse, STATUS_CONFLICT, STATUS_STORED};
use uplink_transfer::{
    ChunkLayout, ChunkStat, OverallStat, PacedHasher, StrongHash, TransferError, TransferProgress,
    fingerprint_source,
};

use crate::config::UploaderConfig;
use crate::error::{ErrorKind, UploadError};
use crate::transport::{HttpRequest, ProgressFn, TokenIssuer, Transport};
use crate::types::{Step, UploadEvent, UploadOutcome, UploadProgress, Uploadable};

type HashTask = JoinHandle<Result<StrongHash, TransferError>>;

/// Retry deadline used when the configured delay overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct UploaderState {
    step: Step,
    started: bool,
    /// Chunk being sent (or about to be). Only advances.
    index: u64,
    token: Option<String>,
    current: ChunkStat,
    overall: OverallStat,
    retry_at: Option<Instant>,
    outcome: Option<UploadOutcome>,
}

impl UploaderState {
    fn new() -> Self {
        Self {
            step: Step::Waiting,
            started: false,
            index: 0,
            token: None,
            current: ChunkStat::idle(Instant::now()),
            overall: OverallStat::default(),
            retry_at: None,
            outcome: None,
        }
    }

    /// Moves to `step` unless a cancellation is pending.
    fn set_step(&mut self, step: Step) {
        if self.step != Step::Cancelling {
            self.step = step;
        }
    }

    fn progress(&self, total_size: u64) -> UploadProgress {
        UploadProgress {
            step: self.step,
            retry_at: self.retry_at,
            transfer: TransferProgress::compute(total_size, &self.current, &self.overall),
        }
    }
}

fn lock(state: &Mutex<UploaderState>) -> MutexGuard<'_, UploaderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Uploads one file into its reserved node.
///
/// [`run`](Self::run) drives the whole lifecycle and never fails; the
/// result is reported as an [`UploadOutcome`], through the
/// [`UploadEvent::UploadEnded`] event and [`outcome`](Self::outcome).
pub struct ChunkUploader {
    id: ReferenceId,
    uploadable: Uploadable,
    layout: ChunkLayout,
    config: UploaderConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenIssuer>,
    state: Arc<Mutex<UploaderState>>,
    cancel: CancellationToken,
    events_tx: Option<mpsc::Sender<UploadEvent>>,
}

impl ChunkUploader {
    pub fn new(
        id: ReferenceId,
        uploadable: Uploadable,
        config: UploaderConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        let layout = ChunkLayout::new(uploadable.size, config.chunk_size);
        Self {
            id,
            uploadable,
            layout,
            config,
            transport,
            tokens,
            state: Arc::new(Mutex::new(UploaderState::new())),
            cancel: CancellationToken::new(),
            events_tx: None,
        }
    }

    /// Sends lifecycle events to `events_tx`.
    ///
    /// Lifecycle events wait for channel capacity; chunk progress events
    /// are dropped when the channel is full.
    pub fn with_events(mut self, events_tx: mpsc::Sender<UploadEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    pub fn uploadable(&self) -> &Uploadable {
        &self.uploadable
    }

    pub fn step(&self) -> Step {
        self.lock_state().step
    }

    /// Index of the chunk being sent, or about to be.
    pub fn index(&self) -> u64 {
        self.lock_state().index
    }

    /// Total number of chunks of the file.
    pub fn chunks_count(&self) -> u64 {
        self.layout.count()
    }

    /// The token in use, once preparation has finished.
    pub fn token(&self) -> Option<String> {
        self.lock_state().token.clone()
    }

    pub fn progress(&self) -> UploadProgress {
        self.lock_state().progress(self.layout.size())
    }

    /// How the upload ended, once it has.
    pub fn outcome(&self) -> Option<UploadOutcome> {
        self.lock_state().outcome.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests cancellation. Idempotent.
    ///
    /// Takes effect at the next checkpoint; a pending retry or pacing
    /// sleep is woken immediately. A request already in flight is
    /// allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut state = self.lock_state();
        if state.outcome.is_none() && state.step != Step::Cancelling {
            state.step = Step::Cancelling;
            state.retry_at = None;
            debug!(node_id = %self.uploadable.node_id, "upload cancellation requested");
        }
    }

    /// Runs the upload to completion.
    ///
    /// Only the first call does any work; later calls return the recorded
    /// outcome.
    pub async fn run(&self) -> UploadOutcome {
        {
            let mut state = self.lock_state();
            if state.started {
                warn!(node_id = %self.uploadable.node_id, "upload already started");
                return state
                    .outcome
                    .clone()
                    .unwrap_or_else(|| UploadOutcome::Failed("upload already running".into()));
            }
            state.started = true;
        }

        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => UploadOutcome::from(e),
        };

        {
            let mut state = self.lock_state();
            state.step = outcome.final_step();
            state.retry_at = None;
            state.outcome = Some(outcome.clone());
        }

        let node_id = &self.uploadable.node_id;
        match &outcome {
            UploadOutcome::Uploaded => info!(node_id = %node_id, "upload completed"),
            UploadOutcome::AlreadyUploaded => info!(node_id = %node_id, "content already on server"),
            UploadOutcome::Cancelled => info!(node_id = %node_id, "upload cancelled"),
            UploadOutcome::Conflict => warn!(node_id = %node_id, "upload conflict"),
            UploadOutcome::Failed(error) => warn!(node_id = %node_id, error = %error, "upload failed"),
        }

        self.emit(UploadEvent::UploadEnded {
            id: self.id,
            node_id: node_id.clone(),
            outcome: outcome.clone(),
        })
        .await;
        outcome
    }

    async fn execute(&self) -> Result<UploadOutcome, UploadError> {
        self.checkpoint()?;
        self.set_step(Step::Preparing);
        let token = self.prepare().await?;

        self.checkpoint()?;
        self.set_step(Step::Probing);
        self.emit(UploadEvent::ProbeStarted {
            id: self.id,
            node_id: self.uploadable.node_id.clone(),
        })
        .await;

        let first_chunk = self.probe(&token).await?;
        self.emit(UploadEvent::ProbeEnded {
            id: self.id,
            node_id: self.uploadable.node_id.clone(),
        })
        .await;

        let Some(first_chunk) = first_chunk else {
            return Ok(UploadOutcome::AlreadyUploaded);
        };

        self.checkpoint()?;
        self.upload(&token, first_chunk).await?;
        Ok(UploadOutcome::Uploaded)
    }

    // -----------------------------------------------------------------------
    // Preparing
    // -----------------------------------------------------------------------

    async fn prepare(&self) -> Result<String, UploadError> {
        let token = match &self.uploadable.token {
            Some(token) => token.clone(),
            None => {
                debug!(node_id = %self.uploadable.node_id, "requesting upload token");
                self.tokens.request_token(&self.uploadable.node_id).await?
            }
        };
        self.lock_state()
            .token
            .get_or_insert_with(|| token.clone());
        Ok(token)
    }

    // -----------------------------------------------------------------------
    // Probing
    // -----------------------------------------------------------------------

    /// Negotiates the resume point. `None` means the server already has
    /// the whole file.
    async fn probe(&self, token: &str) -> Result<Option<u64>, UploadError> {
        self.checkpoint()?;
        let hashes = fingerprint_source(
            self.uploadable.source.as_ref(),
            &self.layout,
            self.config.fingerprint_prefix,
        )
        .await?;
        debug!(
            node_id = %self.uploadable.node_id,
            chunks = hashes.len(),
            "fingerprints computed"
        );

        let mut lookahead = None;
        let result = self.negotiate(token, hashes, &mut lookahead).await;
        if let Some(task) = lookahead {
            task.abort();
        }
        result
    }

    async fn negotiate(
        &self,
        token: &str,
        hashes: Vec<String>,
        lookahead: &mut Option<HashTask>,
    ) -> Result<Option<u64>, UploadError> {
        let mut request = ProbeRequest {
            hashes,
            chunks: Vec::new(),
        };

        loop {
            self.checkpoint()?;

            // Hash the next chunk while the round trip is in flight.
            let next = request.chunks.len() as u64;
            if lookahead.is_none() && next < self.layout.count() {
                *lookahead = Some(self.spawn_strong_hash(next));
            }

            let response = self.send_probe(token, &request).await?;
            match response.decision()? {
                ProbeDecision::NeedMoreChunks => {
                    let task = lookahead.take().ok_or_else(|| {
                        UploadError::Protocol(format!(
                            "server asked for hash of chunk {next}, file has {} chunks",
                            self.layout.count()
                        ))
                    })?;
                    let hash = task
                        .await
                        .map_err(|e| UploadError::Hashing(e.to_string()))??;
                    trace!(node_id = %self.uploadable.node_id, index = next, "strong hash supplied");
                    request.chunks.push(hash.wire());
                }
                ProbeDecision::FullyUploaded => return Ok(None),
                ProbeDecision::ResumeFrom(index) => return Ok(Some(index)),
            }
        }
    }

    fn spawn_strong_hash(&self, index: u64) -> HashTask {
        let source = Arc::clone(&self.uploadable.source);
        let cancel = self.cancel.clone();
        let range = self.layout.range(index);
        let hasher = PacedHasher::new(self.config.hash_increment, self.config.pacing_rate);
        tokio::spawn(async move { hasher.hash_range(source.as_ref(), range, &cancel).await })
    }

    async fn send_probe(
        &self,
        token: &str,
        body: &ProbeRequest,
    ) -> Result<ProbeResponse, UploadError> {
        let request = HttpRequest::put(probe_path(&self.uploadable.node_id))
            .query(QUERY_TOKEN, token)
            .header(HEADER_CHUNK_SIZE, self.layout.chunk_size())
            .header(HEADER_UPLOAD_CONTENT_LENGTH, self.layout.size())
            .header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(serde_json::to_vec(body)?);

        let response = self.transport.send(request, None).await?;
        if response.status != STATUS_STORED {
            return Err(UploadError::Status {
                status: response.status,
            });
        }
        Ok(ProbeResponse::from_slice(&response.body)?)
    }

    // -----------------------------------------------------------------------
    // Uploading
    // -----------------------------------------------------------------------

    async fn upload(&self, token: &str, first_chunk: u64) -> Result<(), UploadError> {
        let count = self.layout.count();
        {
            let mut state = self.lock_state();
            state.index = first_chunk;
            state.overall.bytes_skipped = self.layout.skipped_bytes(first_chunk);
            state.current = ChunkStat::idle(Instant::now());
            state.set_step(Step::Uploading);
        }
        info!(
            node_id = %self.uploadable.node_id,
            first_chunk,
            chunks = count,
            "upload started"
        );
        self.emit(UploadEvent::UploadStarted {
            id: self.id,
            node_id: self.uploadable.node_id.clone(),
            first_chunk,
            chunks: count,
        })
        .await;

        for index in first_chunk..count {
            self.checkpoint()?;
            self.lock_state().index = index;
            self.transfer_chunk(token, index).await?;
        }
        Ok(())
    }

    /// Sends chunk `index`, retrying technical failures with backoff.
    ///
    /// The chunk is read again for every attempt, so a failed read backs
    /// off like a failed request.
    async fn transfer_chunk(&self, token: &str, index: u64) -> Result<(), UploadError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            self.checkpoint()?;
            attempt += 1;

            let progress = self.begin_chunk();
            self.emit(UploadEvent::ChunkStarted {
                id: self.id,
                node_id: self.uploadable.node_id.clone(),
                index,
                progress,
            })
            .await;

            let err = match self.send_chunk(token, index).await {
                Ok(chunk_len) => {
                    let progress = self.finish_chunk(chunk_len);
                    debug!(
                        node_id = %self.uploadable.node_id,
                        index,
                        attempt,
                        last = self.layout.is_last(index),
                        "chunk stored"
                    );
                    self.emit(UploadEvent::ChunkEnded {
                        id: self.id,
                        node_id: self.uploadable.node_id.clone(),
                        index,
                        progress,
                    })
                    .await;
                    return Ok(());
                }
                Err(e) => e,
            };

            if err.kind() != ErrorKind::Technical {
                return Err(err);
            }
            if !retry.allows_retry(attempt) {
                warn!(
                    node_id = %self.uploadable.node_id,
                    index,
                    attempt,
                    error = %err,
                    "chunk transfer failed, giving up"
                );
                return Err(err);
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                node_id = %self.uploadable.node_id,
                index,
                attempt,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "chunk transfer failed, retrying"
            );
            let retry_at = self.enter_retry(delay);
            self.emit(UploadEvent::Retrying {
                id: self.id,
                node_id: self.uploadable.node_id.clone(),
                index,
                attempt,
                delay,
            })
            .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }

    /// Reads chunk `index` and sends it. Returns the chunk length.
    async fn send_chunk(&self, token: &str, index: u64) -> Result<u64, UploadError> {
        let range = self.layout.range(index);
        let data = self
            .uploadable
            .source
            .read_range(range.start, range.end)
            .await?;
        let chunk_len = data.len() as u64;
        self.put_chunk(token, index, Bytes::from(data)).await?;
        Ok(chunk_len)
    }

    async fn put_chunk(&self, token: &str, index: u64, data: Bytes) -> Result<(), UploadError> {
        let chunk_len = data.len() as u64;
        let mut request = HttpRequest::put(pipe_path(&self.uploadable.node_id, index))
            .query(QUERY_TOKEN, token)
            .header(HEADER_CHUNK_SIZE, self.layout.chunk_size())
            .header(HEADER_UPLOAD_CONTENT_LENGTH, self.layout.size())
            .header(HEADER_UPLOAD_CONTENT_TYPE, &self.uploadable.mime)
            .header(HEADER_CONTENT_TYPE, CONTENT_TYPE_OCTET_STREAM);
        for (name, value) in NO_STORE_HEADERS {
            request = request.header(name, value);
        }
        let request = request.body(data);

        let progress = self.progress_reporter(index, chunk_len);
        let response = self.transport.send(request, Some(progress)).await?;
        match response.status {
            STATUS_STORED => Ok(()),
            STATUS_CONFLICT => Err(UploadError::Conflict),
            status => Err(UploadError::Status { status }),
        }
    }

    /// Builds the callback the transport reports sent body bytes to.
    fn progress_reporter(&self, index: u64, chunk_len: u64) -> ProgressFn {
        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        let id = self.id;
        let node_id = self.uploadable.node_id.clone();
        let total_size = self.layout.size();

        Arc::new(move |sent: u64| {
            let progress = {
                let mut state = lock(&state);
                let started_at = state.current.started_at;
                state.current = ChunkStat::measure(started_at, sent.min(chunk_len), Instant::now());
                state.set_step(Step::Uploading);
                state.progress(total_size)
            };
            if let Some(tx) = &events_tx {
                let event = UploadEvent::ChunkProgress {
                    id,
                    node_id: node_id.clone(),
                    index,
                    progress,
                };
                if tx.try_send(event).is_err() {
                    trace!(node_id = %node_id, index, "progress event dropped");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // State helpers
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, UploaderState> {
        lock(&self.state)
    }

    fn set_step(&self, step: Step) {
        self.lock_state().set_step(step);
    }

    fn checkpoint(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    fn begin_chunk(&self) -> UploadProgress {
        let mut state = self.lock_state();
        state.set_step(Step::Uploading);
        state.retry_at = None;
        state.current = ChunkStat::idle(Instant::now());
        state.progress(self.layout.size())
    }

    fn finish_chunk(&self, chunk_len: u64) -> UploadProgress {
        let mut state = self.lock_state();
        let now = Instant::now();
        let chunk = ChunkStat::measure(state.current.started_at, chunk_len, now);
        state.overall.fold(&chunk);
        state.current = ChunkStat::idle(now);
        state.progress(self.layout.size())
    }

    fn enter_retry(&self, delay: Duration) -> Instant {
        let mut state = self.lock_state();
        let now = Instant::now();
        let retry_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        state.set_step(Step::Retrying);
        state.retry_at = Some(retry_at);
        state.current = ChunkStat::idle(now);
        retry_at
    }

    async fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events_tx
            && tx.send(event).await.is_err()
        {
            trace!(node_id = %self.uploadable.node_id, "upload event receiver dropped");
        }
    }
}

impl Operation for ChunkUploader {
    fn start(&self) -> OperationFuture<'_> {
        Box::pin(async move {
            self.run().await;
        })
    }
}
