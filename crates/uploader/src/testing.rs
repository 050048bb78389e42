//! Scripted transport and token issuer shared by the unit tests.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use uplink_protocol::ProbeRequest;
use uplink_transfer::{ByteSource, ReadFuture, TransferError};

use crate::error::UploadError;
use crate::transport::{HttpRequest, HttpResponse, ProgressFn, TokenIssuer, Transport, TransportFuture};

pub(crate) type Reply = Result<HttpResponse, UploadError>;

/// Transport answering from scripted probe and pipe replies.
///
/// Once a script runs out, probes answer `{"firstChunk":0}` and pipes
/// answer 200. Chunk progress is reported at half and full body length.
#[derive(Default)]
pub(crate) struct MockTransport {
    requests: Mutex<Vec<HttpRequest>>,
    probe: Mutex<VecDeque<Reply>>,
    pipe: Mutex<VecDeque<Reply>>,
}

impl MockTransport {
    pub(crate) fn new(probe: Vec<Reply>, pipe: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            probe: Mutex::new(probe.into()),
            pipe: Mutex::new(pipe.into()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn probes(&self) -> Vec<ProbeRequest> {
        self.requests()
            .iter()
            .filter(|r| r.path.ends_with("/probe"))
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    pub(crate) fn pipes(&self) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with("/pipe"))
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> TransportFuture<'_, HttpResponse> {
        Box::pin(async move {
            let is_probe = request.path.ends_with("/probe");
            if let Some(progress) = progress {
                let len = request.body.len() as u64;
                progress(len / 2);
                progress(len);
            }
            self.requests.lock().unwrap().push(request);
            let script = if is_probe { &self.probe } else { &self.pipe };
            let reply = script.lock().unwrap().pop_front();
            match reply {
                Some(reply) => reply,
                None if is_probe => json(r#"{"firstChunk":0}"#),
                None => status(200),
            }
        })
    }
}

#[derive(Default)]
pub(crate) struct MockIssuer {
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) fail: bool,
}

impl TokenIssuer for MockIssuer {
    fn request_token<'a>(&'a self, node_id: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(node_id.to_string());
            if self.fail {
                Err(UploadError::Token("license denied".into()))
            } else {
                Ok("issued".to_string())
            }
        })
    }
}

pub(crate) fn json(body: &str) -> Reply {
    Ok(HttpResponse::new(200, body.as_bytes().to_vec()))
}

pub(crate) fn status(code: u16) -> Reply {
    Ok(HttpResponse::new(code, Vec::new()))
}

/// In-memory source that records every range read and can fail its
/// first full-chunk reads.
pub(crate) struct RecordingSource {
    data: Vec<u8>,
    chunk_size: u64,
    reads: Mutex<Vec<Range<u64>>>,
    failures: Mutex<u32>,
}

impl RecordingSource {
    pub(crate) fn new(data: &[u8], chunk_size: u64) -> Self {
        Self {
            data: data.to_vec(),
            chunk_size,
            reads: Mutex::new(Vec::new()),
            failures: Mutex::new(0),
        }
    }

    /// Fails the next `count` reads that cover a whole chunk.
    pub(crate) fn failing_chunk_reads(self, count: u32) -> Self {
        *self.failures.lock().unwrap() = count;
        self
    }

    /// Indices of the chunks that were read in full, in read order.
    pub(crate) fn full_chunk_reads(&self) -> Vec<u64> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.end - r.start == self.chunk_size)
            .map(|r| r.start / self.chunk_size)
            .collect()
    }
}

impl ByteSource for RecordingSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_> {
        Box::pin(async move {
            let end = end.min(self.len());
            self.reads.lock().unwrap().push(start..end);
            if end - start == self.chunk_size {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TransferError::Io(std::io::Error::other("transient")));
                }
            }
            Ok(self.data[start as usize..end as usize].to_vec())
        })
    }
}
