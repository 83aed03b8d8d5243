//! Shared transfer counters and the periodic progress ticker.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use loadstream_protocol::frames::Frame;
use loadstream_store::StateStore;

/// Counters shared between the workers and the ticker.
///
/// `bytes` only ever grows, so readers see a monotonically non-decreasing
/// transfer total.
pub struct ProgressCounters {
    total_bytes: u64,
    total_parts: u32,
    bytes: AtomicU64,
    active_workers: AtomicUsize,
    started: Instant,
}

impl ProgressCounters {
    /// `resumed_bytes` seeds the counter when picking up a crashed job.
    pub fn new(total_bytes: u64, total_parts: u32, resumed_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            total_bytes,
            total_parts,
            bytes: AtomicU64::new(resumed_bytes),
            active_workers: AtomicUsize::new(0),
            started: Instant::now(),
        })
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Builds a `progress` frame from the current counters.
    ///
    /// Speed is the cumulative mean since the job (re)started; ETA is 0
    /// until there is a measurable rate.
    pub fn snapshot(&self, upload_id: &str, completed_parts: u32) -> Frame {
        let bytes = self.bytes();
        let percent = if self.total_bytes == 0 {
            if completed_parts >= self.total_parts { 100.0 } else { 0.0 }
        } else {
            100.0 * bytes as f64 / self.total_bytes as f64
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        let eta = if speed > 0.0 {
            ((self.total_bytes.saturating_sub(bytes)) as f64 / speed).round() as u64
        } else {
            0
        };

        Frame::Progress {
            upload_id: upload_id.into(),
            percent,
            speed,
            eta,
            bytes_transferred: bytes,
            total_bytes: self.total_bytes,
            active_threads: self.active_workers(),
            completed_parts,
            total_parts: self.total_parts,
        }
    }
}

/// Emits a `progress` frame every `interval` until cancelled, then one
/// final frame so observers see the terminal counters.
pub async fn run_ticker(
    counters: Arc<ProgressCounters>,
    store: Arc<StateStore>,
    upload_id: String,
    interval: std::time::Duration,
    events: broadcast::Sender<Frame>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.count_completed(&upload_id) {
                    Ok(completed) => {
                        let _ = events.send(counters.snapshot(&upload_id, completed));
                    }
                    Err(e) => warn!("progress tick could not count parts: {e}"),
                }
            }
        }
    }

    if let Ok(completed) = store.count_completed(&upload_id) {
        let _ = events.send(counters.snapshot(&upload_id, completed));
    }
}
