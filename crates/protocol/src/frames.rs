//! WebSocket frames exchanged with the local UI.
//!
//! Outbound frames are tagged by a `type` field and use camelCase names,
//! which is what the browser side expects. Inbound commands are tagged by
//! `action`; anything that fails to parse is ignored by the server.

use serde::{Deserialize, Serialize};

/// Lifecycle phase reported in `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Preparing,
    Uploading,
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// Per-part state reported in `chunk` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Uploading,
    Completed,
    Failed,
}

/// Error codes surfaced in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UploadInProgress,
    FileLockFailed,
    InitiateFailed,
    Incomplete,
    UploadError,
}

/// Outbound frame: agent → UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Pushed once on every new connection.
    Config {
        #[serde(rename = "chunkSizeMB")]
        chunk_size_mb: u64,
        max_threads: usize,
        presign_batch_size: usize,
        ws_port: u16,
    },
    /// Periodic transfer snapshot while a job is active.
    Progress {
        upload_id: String,
        percent: f64,
        /// Bytes per second, cumulative mean since the job started.
        speed: f64,
        /// Estimated seconds remaining (0 when speed is 0).
        eta: u64,
        bytes_transferred: u64,
        total_bytes: u64,
        active_threads: usize,
        completed_parts: u32,
        total_parts: u32,
    },
    /// Per-part lifecycle event.
    Chunk {
        upload_id: String,
        part_number: u32,
        status: ChunkState,
        #[serde(skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
    },
    /// Job-level phase transition.
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        status: StatusKind,
        message: String,
    },
    /// Job-level failure.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        error: String,
        code: ErrorCode,
    },
}

/// Inbound command: UI → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Command {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_url: Option<String>,
    },
    Pause,
    Resume,
    Cancel,
}
