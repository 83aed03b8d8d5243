//! Presigned-URL prefetching.
//!
//! A single producer keeps a bounded pool of `{part, url, expires_at}`
//! entries topped up ahead of the workers. Backpressure is the pool's
//! high watermark: the producer sleeps while the next batch would not
//! fit. Consumers take the entry for their part; expired entries are
//! discarded and re-requested instead of being PUT against.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use loadstream_protocol::coordinator::PresignedUrl;

use crate::coordinator::{CoordinatorClient, JobRef};

/// How long a worker waits for its part's URL before giving up the pass.
pub const URL_WAIT_BUDGET: Duration = Duration::from_secs(30);

/// URLs this close to expiry are treated as already expired.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Delay between presign retries after a coordinator failure.
const PRESIGN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Whether `entry` is still safely inside its validity window.
pub fn is_fresh(entry: &PresignedUrl) -> bool {
    is_usable(entry, Utc::now())
}

fn is_usable(entry: &PresignedUrl, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(&entry.expires_at) {
        Ok(expires) => (expires.with_timezone(&Utc) - now).num_seconds() > EXPIRY_MARGIN_SECS,
        Err(e) => {
            warn!(part = entry.part_number, "unparseable expires_at: {e}");
            false
        }
    }
}

/// Bounded pool of presigned URLs keyed by part number.
pub struct UrlPool {
    lookahead: usize,
    entries: Mutex<HashMap<u32, PresignedUrl>>,
    /// Woken when entries are added.
    produced: Notify,
    /// Woken when entries are taken.
    consumed: Notify,
}

impl UrlPool {
    pub fn new(lookahead: usize) -> Arc<Self> {
        Arc::new(Self {
            lookahead: lookahead.max(1),
            entries: Mutex::new(HashMap::new()),
            produced: Notify::new(),
            consumed: Notify::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a batch of entries and wakes waiting consumers.
    pub fn insert(&self, urls: Vec<PresignedUrl>) {
        let mut entries = self.entries.lock().unwrap();
        for url in urls {
            entries.insert(url.part_number, url);
        }
        drop(entries);
        self.produced.notify_waiters();
    }

    /// Waits until a batch of `needed` more entries fits under the
    /// watermark. Returns `false` on cancellation.
    pub async fn wait_capacity(&self, needed: usize, cancel: &CancellationToken) -> bool {
        loop {
            let mut notified = std::pin::pin!(self.consumed.notified());
            // Register before re-checking so a take() between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if self.len() + needed <= self.lookahead {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Takes the URL for `part` if present and still fresh.
    ///
    /// An expired entry is removed and queued on `refresh`; entries for
    /// other parts are left in place for their owners.
    fn try_take(&self, part: u32, refresh: &mpsc::UnboundedSender<u32>) -> Option<PresignedUrl> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(&part)?;
        drop(entries);
        self.consumed.notify_waiters();

        if is_usable(&entry, Utc::now()) {
            Some(entry)
        } else {
            debug!(part, "discarding expired presigned url");
            let _ = refresh.send(part);
            None
        }
    }

    /// Waits up to `budget` for a usable URL for `part`.
    pub async fn take(
        &self,
        part: u32,
        budget: Duration,
        refresh: &mpsc::UnboundedSender<u32>,
        cancel: &CancellationToken,
    ) -> Option<PresignedUrl> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let mut notified = std::pin::pin!(self.produced.notified());
            // Register before the lookup so an insert landing in between
            // still wakes this waiter.
            notified.as_mut().enable();
            if let Some(url) = self.try_take(part, refresh) {
                return Some(url);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = &mut notified => {}
            }
        }
    }
}

/// Producer half: drains the request queue in batches and keeps the pool
/// filled.
pub struct Prefetcher {
    client: CoordinatorClient,
    job: JobRef,
    pool: Arc<UrlPool>,
    requests: mpsc::UnboundedReceiver<u32>,
    batch_size: usize,
}

impl Prefetcher {
    pub fn new(
        client: CoordinatorClient,
        job: JobRef,
        pool: Arc<UrlPool>,
        requests: mpsc::UnboundedReceiver<u32>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            job,
            pool,
            requests,
            batch_size: batch_size.clamp(1, loadstream_protocol::MAX_PRESIGN_BATCH),
        }
    }

    /// Runs until the request queue closes or the job is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return,
                req = self.requests.recv() => match req {
                    Some(part) => part,
                    None => return,
                },
            };

            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match self.requests.try_recv() {
                    Ok(part) => {
                        if !batch.contains(&part) {
                            batch.push(part);
                        }
                    }
                    Err(_) => break,
                }
            }

            if !self.pool.wait_capacity(batch.len(), &cancel).await {
                return;
            }

            // Presign failures fall back to a fixed-delay retry; the
            // workers' own 30 s budget bounds how long this can stall a
            // part.
            loop {
                match self.client.presign_batch(&self.job, &batch).await {
                    Ok(urls) => {
                        debug!(count = urls.len(), "presigned batch received");
                        self.pool.insert(urls);
                        break;
                    }
                    Err(e) => {
                        warn!("presign batch failed: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(PRESIGN_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}
