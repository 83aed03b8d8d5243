//! Shared wire types for the Loadstream upload agent.
//!
//! Two surfaces live here:
//! - [`coordinator`]: JSON bodies of the backend coordinator's REST API
//!   (initiate / presign / complete / abort).
//! - [`frames`]: the local WebSocket vocabulary the agent speaks with a
//!   browser UI, both the outbound `config`/`progress`/`chunk`/`status`/
//!   `error` frames and the inbound control commands.
//!
//! This crate is pure data: serde derives and a handful of helpers, no I/O.

pub mod coordinator;
pub mod frames;

/// Maximum part numbers the coordinator accepts per presign request.
pub const MAX_PRESIGN_BATCH: usize = 100;

/// Content type sent with every part PUT and with `initiate`.
pub const OCTET_STREAM: &str = "application/octet-stream";
