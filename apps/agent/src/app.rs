//! Agent wiring: state store, supervisor, control server, shutdown.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use loadstream_control::{ControlServer, ServerConfig};
use loadstream_engine::{config as engine_config, Supervisor};
use loadstream_protocol::frames::Frame;
use loadstream_store::StateStore;

use crate::config::Config;

/// Capacity of the event fan-out channel. Chunk events for wide worker
/// pools burst, so leave headroom before slow clients start lagging.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Supervisor command queue depth.
const COMMAND_CHANNEL_SIZE: usize = 16;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let engine_cfg = config.engine_config();

    // Durable state lives next to the agent's other data.
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(StateStore::open(&data_dir.join("loadstream.db"))?);

    let http = reqwest::Client::new();
    let (events_tx, _) = broadcast::channel::<Frame>(EVENT_CHANNEL_SIZE);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let root = CancellationToken::new();

    // Supervisor task.
    let supervisor = Supervisor::new(
        engine_cfg.clone(),
        Arc::clone(&store),
        http.clone(),
        events_tx.clone(),
        commands_rx,
    );
    let supervisor_handle = tokio::spawn(supervisor.run(root.child_token()));

    // Control surface. The config frame mirrors the effective tunables.
    let max_threads = engine_cfg.effective_workers(
        engine_cfg.part_size_bytes,
        engine_config::cpu_cores(),
        engine_config::available_memory(),
    );
    let config_frame = Frame::Config {
        chunk_size_mb: engine_cfg.part_size_bytes / (1024 * 1024),
        max_threads,
        presign_batch_size: engine_cfg.presign_batch_size,
        ws_port: engine_cfg.ws_port,
    };
    let control = ControlServer::new(
        ServerConfig {
            port: engine_cfg.ws_port,
        },
        config_frame,
        commands_tx,
        events_tx,
    );
    let control_run = Arc::clone(&control);
    let control_handle = tokio::spawn(async move { control_run.run().await });

    // Run until interrupted.
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");

    root.cancel();
    control.shutdown();
    let _ = supervisor_handle.await;
    let _ = control_handle.await;

    Ok(())
}
