/// Size of one transfer chunk (50 MiB).
///
/// The same interval is used for weak fingerprints, strong hashes and
/// the byte ranges sent to the pipe endpoint.
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Number of leading bytes of each chunk covered by its weak fingerprint.
pub const FINGERPRINT_PREFIX_LEN: u64 = 64 * 1024;

/// Strong hashes are fed in increments of this size (1 MiB).
pub const HASH_INCREMENT_LEN: u64 = 1024 * 1024;

/// The only status the pipe and probe endpoints use for success.
pub const STATUS_STORED: u16 = 200;

/// Returned by the pipe endpoint when the server-side node changed.
pub const STATUS_CONFLICT: u16 = 409;

/// License type requested when the uploadable carries no token.
pub const UPLOAD_TOKEN_LICENSE: &str = "upload_token";

/// Reservation entries of this type are uploadable files.
pub const TOUCH_TYPE_FILE: &str = "file";

// Header names.
pub const HEADER_CHUNK_SIZE: &str = "chunk-size";
pub const HEADER_UPLOAD_CONTENT_LENGTH: &str = "x-upload-content-length";
pub const HEADER_UPLOAD_CONTENT_TYPE: &str = "x-upload-content-type";
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// Cache-busting headers sent with every chunk.
pub const NO_STORE_HEADERS: [(&str, &str); 3] = [
    ("cache-control", "no-store"),
    ("pragma", "no-store"),
    ("expires", "0"),
];

/// Query parameter carrying the upload token.
pub const QUERY_TOKEN: &str = "token";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Path of the probe endpoint for a node (relative to the API root).
pub fn probe_path(node_id: &str) -> String {
    format!("/node/{node_id}/probe")
}

/// Path of the chunk pipe endpoint for a node and chunk index.
pub fn pipe_path(node_id: &str, index: u64) -> String {
    format!("/node/{node_id}/index/{index}/pipe")
}

/// Path of the license (token issuance) endpoint.
pub const LICENSE_PATH: &str = "/node/license";
