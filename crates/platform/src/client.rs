//! Upload API client.
//!
//! Async HTTP client using `reqwest`. Chunk bodies are streamed in
//! [`PROGRESS_SLICE`]-sized pieces so the uploader sees send progress.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use reqwest::header::CONTENT_LENGTH;
use tracing::{debug, warn};

use uplink_protocol::constants::{LICENSE_PATH, QUERY_TOKEN};
use uplink_protocol::{LicenseRequest, LicenseResponse};
use uplink_uploader::{
    HttpRequest, HttpResponse, Method, ProgressFn, TokenIssuer, Transport, TransportFuture,
    UploadError,
};

use crate::config::PlatformConfig;

/// Size of the body pieces progress is reported for.
pub const PROGRESS_SLICE: usize = 64 * 1024;

/// Errors from the platform client.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no upload token issued for node {0}")]
    MissingToken(String),
}

/// Upload API client.
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl PlatformClient {
    pub fn new(config: &PlatformConfig) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends `request` and returns whatever status the server answered.
    async fn execute(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, reqwest::Error> {
        let method = match request.method {
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
        };
        let len = request.body.len();

        let mut builder = self
            .http
            .request(method, self.url(&request.path))
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match progress {
            Some(progress) => builder
                .header(CONTENT_LENGTH, len.to_string())
                .body(progress_body(request.body, progress)),
            None => builder.body(request.body),
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        debug!(path = %request.path, status, bytes = len, "request completed");
        Ok(HttpResponse::new(status, body))
    }

    /// Requests an upload token for `node_id` from the license endpoint.
    pub async fn request_upload_token(&self, node_id: &str) -> Result<String, PlatformError> {
        let resp = self
            .http
            .post(self.url(LICENSE_PATH))
            .query(&[(QUERY_TOKEN, self.access_token.as_str())])
            .json(&LicenseRequest::upload_token(node_id))
            .send()
            .await?;
        let status = resp.status().as_u16();

        if !matches!(status, 200 | 201 | 202 | 204) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::Api { status, body });
        }

        let body = resp.bytes().await?;
        let license: LicenseResponse = serde_json::from_slice(&body)?;
        license
            .tokens
            .get(node_id)
            .cloned()
            .ok_or_else(|| PlatformError::MissingToken(node_id.to_string()))
    }
}

impl Transport for PlatformClient {
    fn send(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> TransportFuture<'_, HttpResponse> {
        Box::pin(async move {
            let path = request.path.clone();
            self.execute(request, progress).await.map_err(|e| {
                warn!(path = %path, error = %e, "request failed");
                UploadError::Transport(e.to_string())
            })
        })
    }
}

impl TokenIssuer for PlatformClient {
    fn request_token<'a>(&'a self, node_id: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move {
            self.request_upload_token(node_id).await.map_err(|e| {
                warn!(node_id = %node_id, error = %e, "upload token request failed");
                UploadError::Token(e.to_string())
            })
        })
    }
}

/// Wraps `body` in a stream that reports the cumulative bytes handed to
/// the connection.
fn progress_body(body: Bytes, progress: ProgressFn) -> reqwest::Body {
    let slices: Vec<Bytes> = (0..body.len())
        .step_by(PROGRESS_SLICE)
        .map(|start| body.slice(start..(start + PROGRESS_SLICE).min(body.len())))
        .collect();

    let mut sent = 0u64;
    let stream = stream::iter(slices).map(move |slice| {
        sent += slice.len() as u64;
        progress(sent);
        Ok::<_, std::io::Error>(slice)
    });
    reqwest::Body::wrap_stream(stream)
}
