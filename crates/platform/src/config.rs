use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

/// Where the upload endpoints live and how to authenticate against them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base URL every endpoint path is appended to. No trailing slash.
    pub api_url: String,
    /// Session token sent as the `token` query parameter on license calls.
    pub access_token: String,
    /// Connect timeout in seconds. Requests themselves have no timeout.
    pub connect_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            access_token: String::new(),
            connect_timeout_secs: 30,
        }
    }
}

impl PlatformConfig {
    pub fn new(api_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            access_token: access_token.into(),
            ..Self::default()
        }
    }
}
