//! Upload engine for the Loadstream agent.
//!
//! The engine owns one active job at a time: it locks the source file,
//! plans fixed-size parts, keeps a prefetched pool of presigned URLs,
//! drives a bounded worker pool that PUTs parts straight to object
//! storage, persists per-part receipts so a crash is resumable, and
//! emits progress/status events for the control surface.

pub mod config;
pub mod coordinator;
pub mod pool;
pub mod prefetch;
pub mod progress;
pub mod source;
pub mod supervisor;

pub use config::AgentConfig;
pub use coordinator::{CoordinatorClient, JobRef};
pub use supervisor::Supervisor;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    Store(#[from] loadstream_store::StoreError),

    #[error("could not lock {path}: {reason}")]
    FileLock { path: String, reason: String },

    #[error("coordinator unavailable: {0}")]
    Coordinator(String),

    #[error("file needs {required_parts} parts even at the maximum part size (limit {max_parts})")]
    PartCountOverflow { required_parts: u64, max_parts: u32 },

    #[error("file changed since the upload was created (expected {expected}, found {actual})")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("another upload is already running")]
    UploadInProgress,

    #[error("{0}")]
    Invalid(String),

    #[error("{failed} of {total} parts could not be uploaded")]
    Incomplete { failed: u32, total: u32 },

    #[error("upload cancelled")]
    Cancelled,
}
