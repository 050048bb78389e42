use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::UPLOAD_TOKEN_LICENSE;

// ---------------------------------------------------------------------------
// Token issuance
// ---------------------------------------------------------------------------

/// Requests licenses (upload tokens) for a set of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    pub node_ids: Vec<String>,
    #[serde(rename = "type")]
    pub license_type: String,
}

impl LicenseRequest {
    /// Builds an upload-token request for a single node.
    pub fn upload_token(node_id: &str) -> Self {
        Self {
            node_ids: vec![node_id.to_string()],
            license_type: UPLOAD_TOKEN_LICENSE.to_string(),
        }
    }
}

/// Issued tokens keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseResponse {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Node reservation ("touch")
// ---------------------------------------------------------------------------

/// One file announced to the reservation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Touchable {
    pub lookup_key: String,
    pub name: String,
    /// MIME type.
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    /// Parent directory, with trailing separator. Omitted for flat uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A reserved node, as returned by the reservation endpoint keyed by lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
}
