//! Durable upload state for the Loadstream agent.
//!
//! One SQLite file holds two tables: `uploads` (one row per job) and
//! `parts` (one row per part, keyed by `(upload_id, part_number)`).
//! Every write is committed before the call returns, so a process crash
//! at any point leaves a consistent, resumable picture on disk.

mod db;
mod types;

pub use db::StateStore;
pub use types::{JobStatus, PartRow, PartStatus, UploadJob};

/// Errors produced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("upload {0} already exists")]
    DuplicateUpload(String),

    #[error("upload {0} not found")]
    UploadNotFound(String),

    #[error("part {part} of upload {upload_id} not found")]
    PartNotFound { upload_id: String, part: u32 },

    #[error("part {part} of upload {upload_id} already completed with a different etag")]
    ReceiptConflict { upload_id: String, part: u32 },
}
