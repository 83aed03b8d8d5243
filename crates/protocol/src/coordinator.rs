//! Request/response bodies of the coordinator's upload REST API.
//!
//! Field names are snake_case on the wire, matching the backend service.

use serde::{Deserialize, Serialize};

/// `POST /api/upload/initiate` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_fingerprint: String,
    pub content_type: String,
}

/// `POST /api/upload/initiate` response.
///
/// `chunk_size` and `total_parts` are the coordinator's view; the agent
/// plans parts locally and treats these as advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
    pub chunk_size: u64,
    pub total_parts: u32,
}

/// One presigned PUT URL for a single part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub part_number: u32,
    pub url: String,
    /// RFC 3339 UTC timestamp after which the URL is no longer valid.
    pub expires_at: String,
}

/// `GET /api/upload/presign` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignResponse {
    pub urls: Vec<PresignedUrl>,
}

/// A completed part's receipt, as handed back at finalize time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

/// `POST /api/upload/complete` request. `parts` must be in ascending
/// `part_number` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
    pub parts: Vec<PartReceipt>,
}

/// `POST /api/upload/complete` response. `status == "completed"` iff the
/// storage engine accepted the reassembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_etag: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

/// `POST /api/upload/abort` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortRequest {
    pub upload_id: String,
    pub bucket: String,
    pub object_key: String,
}
