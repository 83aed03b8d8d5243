//! The WebSocket accept loop and per-client session handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loadstream_protocol::frames::{Command, Frame};

use crate::ControlError;

/// Keepalive ping cadence.
const PING_PERIOD: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port on localhost (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// The agent's local WebSocket server.
pub struct ControlServer {
    port: u16,
    /// Sent verbatim to every client on connect.
    config_frame: Frame,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Frame>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ControlServer {
    /// Creates a new server.
    ///
    /// `events` is the engine's broadcast channel; each client gets its
    /// own subscription. `commands` feeds the supervisor.
    pub fn new(
        config: ServerConfig,
        config_frame: Frame,
        commands: mpsc::Sender<Command>,
        events: broadcast::Sender<Frame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            config_frame,
            commands,
            events,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the bound address once [`run`](Self::run) has started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every client session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ControlError> {
        let addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("control server listening on ws://{local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("control server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_client(stream, peer_addr).await {
                                    debug!(%peer_addr, "client session ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    }
                }
            }
        }
    }

    /// One client session: config push, event fan-out, command intake.
    async fn handle_client(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ControlError> {
        let ws_stream = accept_async(stream).await?;
        debug!(%peer_addr, "ui client connected");

        let (mut sink, mut reader) = ws_stream.split();

        // Config goes out before anything else.
        let config_json = serde_json::to_string(&self.config_frame)?;
        sink.send(WsMessage::Text(config_json.into())).await?;

        let mut events = self.events.subscribe();
        let mut ping_interval = tokio::time::interval(PING_PERIOD);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.reset();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = events.recv() => {
                    match event {
                        Ok(frame) => {
                            let json = serde_json::to_string(&frame)?;
                            sink.send(WsMessage::Text(json.into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(%peer_addr, missed, "client fell behind, frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = ping_interval.tick() => {
                    sink.send(WsMessage::Ping(Vec::new().into())).await?;
                }

                frame = reader.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.dispatch_command(&text).await;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sink.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {} // Binary/pong frames ignored.
                        Some(Err(e)) => {
                            debug!(%peer_addr, "read error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let _ = sink.close().await;
        debug!(%peer_addr, "ui client disconnected");
        Ok(())
    }

    /// Parses and forwards one inbound command. Unknown actions and
    /// malformed JSON are logged and dropped.
    async fn dispatch_command(&self, text: &str) {
        match serde_json::from_str::<Command>(text) {
            Ok(command) => {
                debug!(?command, "command received");
                if self.commands.send(command).await.is_err() {
                    warn!("supervisor command channel closed");
                }
            }
            Err(e) => debug!("ignoring unrecognized command: {e}"),
        }
    }
}
