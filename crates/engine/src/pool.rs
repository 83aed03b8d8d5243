//! The bounded upload worker pool.
//!
//! Workers pull part descriptors off a shared queue, resolve a presigned
//! URL, read the part's bytes, PUT them to storage and persist the
//! receipt. Failures are classified at the PUT site: transient ones are
//! retried inline with exponential backoff and may requeue the part for
//! another dispatch round; permanent ones settle the part immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use loadstream_protocol::coordinator::PresignedUrl;
use loadstream_protocol::frames::{ChunkState, Frame};
use loadstream_protocol::OCTET_STREAM;
use loadstream_store::StateStore;

use crate::config::AgentConfig;
use crate::prefetch::{self, UrlPool, URL_WAIT_BUDGET};
use crate::progress::ProgressCounters;
use crate::source::SourceFile;

/// Pause is a gate, not a kill: a paused pool stops dispatching new
/// parts while in-flight PUTs run to completion.
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Waits until the gate is open. Returns `false` on cancellation.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Register before re-checking so a resume() in between is
            // not missed.
            notified.as_mut().enable();
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }
}

/// One dispatchable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTask {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

/// Everything a worker needs, shared across the pool for one job.
pub struct WorkerContext {
    pub cfg: AgentConfig,
    pub upload_id: String,
    pub store: Arc<StateStore>,
    pub source: Arc<SourceFile>,
    pub http: reqwest::Client,
    pub urls: Arc<UrlPool>,
    pub url_refresh: mpsc::UnboundedSender<u32>,
    pub queue_tx: flume::Sender<PartTask>,
    pub queue_rx: flume::Receiver<PartTask>,
    pub gate: Arc<PauseGate>,
    pub progress: Arc<ProgressCounters>,
    pub events: broadcast::Sender<Frame>,
    /// Parts not yet settled (completed or given up). Hits 0 when the
    /// run is over.
    pub remaining: watch::Sender<usize>,
    /// Parts that exhausted their budget or failed permanently.
    pub gave_up: watch::Sender<usize>,
    /// A state-store write failed; the job must fail.
    pub store_fatal: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, frame: Frame) {
        let _ = self.events.send(frame);
    }

    fn chunk_event(&self, part: u32, status: ChunkState, etag: Option<String>) {
        self.emit(Frame::Chunk {
            upload_id: self.upload_id.clone(),
            part_number: part,
            status,
            etag,
        });
    }

    fn settle(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn give_up(&self, part: u32) {
        warn!(part, "part failed for good this run");
        self.chunk_event(part, ChunkState::Failed, None);
        self.gave_up.send_modify(|n| *n += 1);
        self.settle();
    }

    fn store_failure(&self, err: &loadstream_store::StoreError) {
        error!("state store write failed, failing job: {err}");
        self.store_fatal.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Outcome of one PUT attempt.
enum PutError {
    /// Network error, 5xx, 408, 429, or a response without an `ETag`.
    Transient(String),
    /// Any other 4xx. Retrying will not help.
    Permanent(String),
}

/// Runs one worker until the queue drains, the job settles, or the run
/// is cancelled.
pub async fn run_worker(ctx: Arc<WorkerContext>) {
    ctx.progress.worker_started();
    loop {
        if !ctx.gate.wait_ready(&ctx.cancel).await {
            break;
        }
        let task = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            task = ctx.queue_rx.recv_async() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };
        process_part(&ctx, task).await;
        if ctx.store_fatal.load(Ordering::SeqCst) {
            break;
        }
    }
    ctx.progress.worker_stopped();
}

async fn process_part(ctx: &Arc<WorkerContext>, task: PartTask) {
    let part = task.number;
    ctx.chunk_event(part, ChunkState::Uploading, None);
    if let Err(e) = ctx.store.mark_uploading(&ctx.upload_id, part) {
        ctx.store_failure(&e);
        return;
    }

    // Resolve a presigned URL within the per-part budget.
    let Some(mut url) = ctx
        .urls
        .take(part, URL_WAIT_BUDGET, &ctx.url_refresh, &ctx.cancel)
        .await
    else {
        if ctx.cancel.is_cancelled() {
            return;
        }
        warn!(part, "no presigned url within budget");
        fail_and_maybe_requeue(ctx, task);
        return;
    };

    // Read the part's bytes off the async threads.
    let source = Arc::clone(&ctx.source);
    let read = tokio::task::spawn_blocking(move || source.read_at(task.offset, task.length)).await;
    let body = match read {
        Ok(Ok(buf)) => Bytes::from(buf),
        Ok(Err(e)) => {
            warn!(part, "part read failed: {e}");
            fail_and_maybe_requeue(ctx, task);
            return;
        }
        Err(e) => {
            warn!(part, "part read task failed: {e}");
            fail_and_maybe_requeue(ctx, task);
            return;
        }
    };

    // Inline attempts with exponential backoff.
    for attempt in 0..=ctx.cfg.retry_max_attempts {
        // Backoff may outlive the URL's validity window; swap in a fresh
        // one rather than PUT an expired capability.
        if !prefetch::is_fresh(&url) {
            let _ = ctx.url_refresh.send(part);
            match ctx
                .urls
                .take(part, URL_WAIT_BUDGET, &ctx.url_refresh, &ctx.cancel)
                .await
            {
                Some(fresh) => url = fresh,
                None => {
                    if ctx.cancel.is_cancelled() {
                        return;
                    }
                    fail_and_maybe_requeue(ctx, task);
                    return;
                }
            }
        }

        // The in-flight PUT runs to completion; cancellation is observed
        // between attempts and at the pause gate.
        let outcome = put_part(ctx, &url, body.clone()).await;

        match outcome {
            Ok(etag) => {
                match ctx.store.mark_completed(&ctx.upload_id, part, &etag) {
                    Ok(()) => {
                        debug!(part, %etag, "part uploaded");
                        ctx.progress.add_bytes(task.length);
                        ctx.chunk_event(part, ChunkState::Completed, Some(etag));
                        ctx.settle();
                    }
                    Err(e) => ctx.store_failure(&e),
                }
                return;
            }
            Err(PutError::Permanent(reason)) => {
                warn!(part, "permanent upload failure: {reason}");
                if let Err(e) = ctx.store.mark_failed(&ctx.upload_id, part) {
                    ctx.store_failure(&e);
                    return;
                }
                ctx.give_up(part);
                return;
            }
            Err(PutError::Transient(reason)) => {
                let retry_count = match ctx.store.mark_failed(&ctx.upload_id, part) {
                    Ok(count) => count,
                    Err(e) => {
                        ctx.store_failure(&e);
                        return;
                    }
                };
                if attempt < ctx.cfg.retry_max_attempts {
                    let delay = ctx.cfg.retry_delay(attempt);
                    debug!(
                        part,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient upload failure, backing off: {reason}"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    warn!(part, retry_count, "attempts exhausted: {reason}");
                    requeue_or_give_up(ctx, task, retry_count);
                    return;
                }
            }
        }
    }
}

/// Marks the part failed once, then requeues it if budget remains.
fn fail_and_maybe_requeue(ctx: &Arc<WorkerContext>, task: PartTask) {
    match ctx.store.mark_failed(&ctx.upload_id, task.number) {
        Ok(retry_count) => requeue_or_give_up(ctx, task, retry_count),
        Err(e) => ctx.store_failure(&e),
    }
}

fn requeue_or_give_up(ctx: &Arc<WorkerContext>, task: PartTask, retry_count: u32) {
    if retry_count < ctx.cfg.retry_max_attempts {
        ctx.chunk_event(task.number, ChunkState::Failed, None);
        // The part stays outstanding; a fresh URL is requested for the
        // next dispatch.
        let _ = ctx.url_refresh.send(task.number);
        if ctx.queue_tx.send(task).is_err() {
            ctx.give_up(task.number);
        }
    } else {
        ctx.give_up(task.number);
    }
}

async fn put_part(
    ctx: &Arc<WorkerContext>,
    url: &PresignedUrl,
    body: Bytes,
) -> Result<String, PutError> {
    let response = ctx
        .http
        .put(&url.url)
        .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM)
        .timeout(ctx.cfg.http_timeout())
        .body(body)
        .send()
        .await
        .map_err(|e| PutError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        // The quoted ETag string is the receipt, preserved verbatim. A
        // 2xx without one is not trusted.
        return match response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
        {
            Some(etag) if !etag.is_empty() => Ok(etag.to_string()),
            _ => Err(PutError::Transient(format!(
                "{status} response without an ETag header"
            ))),
        };
    }

    let reason = format!("storage returned {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(PutError::Transient(reason))
    } else {
        Err(PutError::Permanent(reason))
    }
}
