//! Local WebSocket control surface for the Loadstream agent.
//!
//! Accepts any number of UI connections on `localhost`, pushes the
//! agent's configuration on connect, broadcasts engine events
//! (`progress`/`chunk`/`status`/`error`) to every client, and forwards
//! parsed control commands to the supervisor. Unparseable or unknown
//! commands are ignored.
//!
//! The server has its own cancellation token and outlives upload jobs.

mod server;

pub use server::{ControlServer, ServerConfig};

/// Errors produced by the control server.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
