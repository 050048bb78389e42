//! Probe negotiation payloads.
//!
//! The client sends every weak fingerprint up front plus the strong
//! hashes computed so far. The server either asks for one more strong
//! hash, reports the node as complete, or names the chunk to resume at.

use serde::{Deserialize, Serialize};

/// Body of a probe round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Weak fingerprints, one per chunk, in chunk order.
    pub hashes: Vec<String>,
    /// Strong hashes for chunks `0..chunks.len()`.
    pub chunks: Vec<String>,
}

/// Raw probe response as sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    #[serde(default)]
    pub need_more_chunks: bool,
    #[serde(default)]
    pub fully_uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk: Option<i64>,
}

/// Interpreted probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Server needs the next strong chunk hash before deciding.
    NeedMoreChunks,
    /// Nothing left to send.
    FullyUploaded,
    /// Transfer must start at this chunk index.
    ResumeFrom(u64),
}

/// Errors while interpreting a probe response.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe response carries no decision")]
    MissingDecision,

    #[error("malformed probe response: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProbeResponse {
    /// Parses a probe response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ProbeError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Interprets the response.
    ///
    /// `needMoreChunks` wins over the other fields. A negative `firstChunk`
    /// means there is nothing to resume and is treated as fully uploaded.
    pub fn decision(&self) -> Result<ProbeDecision, ProbeError> {
        if self.need_more_chunks {
            return Ok(ProbeDecision::NeedMoreChunks);
        }
        if self.fully_uploaded {
            return Ok(ProbeDecision::FullyUploaded);
        }
        match self.first_chunk {
            Some(index) if index < 0 => Ok(ProbeDecision::FullyUploaded),
            Some(index) => Ok(ProbeDecision::ResumeFrom(index as u64)),
            None => Err(ProbeError::MissingDecision),
        }
    }
}

/// Formats a strong chunk hash from its hex-encoded MD5 and SHA1 digests.
pub fn strong_chunk_hash(md5_hex: &str, sha1_hex: &str) -> String {
    format!("{md5_hex}_{sha1_hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_field_names() {
        let req = ProbeRequest {
            hashes: vec!["a".into(), "b".into()],
            chunks: vec!["m_s".into()],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"hashes":["a","b"],"chunks":["m_s"]}"#);
    }

    #[test]
    fn need_more_chunks() {
        let resp = ProbeResponse::from_slice(br#"{"needMoreChunks":true}"#).unwrap();
        assert_eq!(resp.decision().unwrap(), ProbeDecision::NeedMoreChunks);
    }

    #[test]
    fn fully_uploaded() {
        let resp = ProbeResponse::from_slice(br#"{"fullyUploaded":true}"#).unwrap();
        assert_eq!(resp.decision().unwrap(), ProbeDecision::FullyUploaded);
    }

    #[test]
    fn first_chunk() {
        let resp = ProbeResponse::from_slice(br#"{"firstChunk":3}"#).unwrap();
        assert_eq!(resp.decision().unwrap(), ProbeDecision::ResumeFrom(3));

        let resp = ProbeResponse::from_slice(br#"{"needMoreChunks":false,"firstChunk":0}"#).unwrap();
        assert_eq!(resp.decision().unwrap(), ProbeDecision::ResumeFrom(0));
    }

    #[test]
    fn negative_first_chunk_is_complete() {
        let resp = ProbeResponse::from_slice(br#"{"firstChunk":-1}"#).unwrap();
        assert_eq!(resp.decision().unwrap(), ProbeDecision::FullyUploaded);
    }

    #[test]
    fn empty_response_has_no_decision() {
        let resp = ProbeResponse::from_slice(b"{}").unwrap();
        assert!(matches!(resp.decision(), Err(ProbeError::MissingDecision)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            ProbeResponse::from_slice(b"<html>"),
            Err(ProbeError::Json(_))
        ));
    }

    #[test]
    fn strong_hash_format() {
        assert_eq!(strong_chunk_hash("abc", "def"), "abc_def");
    }
}
