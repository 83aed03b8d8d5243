//! Job lifecycle supervision.
//!
//! The supervisor owns the one active job: it validates control
//! commands, drives the prepare → upload → finalize phases, and is the
//! only place job status is written or job-level `status`/`error` frames
//! are emitted. Workers and the ticker publish their own `chunk` and
//! `progress` frames through the shared event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loadstream_protocol::coordinator::PartReceipt;
use loadstream_protocol::frames::{Command, ErrorCode, Frame, StatusKind};
use loadstream_store::{JobStatus, PartRow, PartStatus, StateStore, UploadJob};

use crate::config::{self, AgentConfig};
use crate::coordinator::{CoordinatorClient, JobRef};
use crate::pool::{self, PartTask, PauseGate, WorkerContext};
use crate::prefetch::{Prefetcher, UrlPool};
use crate::progress::{self, ProgressCounters};
use crate::source::{self, SourceFile};
use crate::EngineError;

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Handle on the currently running job task.
struct ActiveJob {
    upload_id_rx: watch::Receiver<Option<String>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ActiveJob {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn upload_id(&self) -> Option<String> {
        self.upload_id_rx.borrow().clone()
    }
}

/// Single-job lifecycle controller.
pub struct Supervisor {
    cfg: AgentConfig,
    store: Arc<StateStore>,
    http: reqwest::Client,
    events: broadcast::Sender<Frame>,
    commands: mpsc::Receiver<Command>,
    active: Option<ActiveJob>,
}

impl Supervisor {
    pub fn new(
        cfg: AgentConfig,
        store: Arc<StateStore>,
        http: reqwest::Client,
        events: broadcast::Sender<Frame>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            cfg,
            store,
            http,
            events,
            commands,
            active: None,
        }
    }

    fn emit(&self, frame: Frame) {
        let _ = self.events.send(frame);
    }

    fn emit_error(&self, upload_id: Option<String>, code: ErrorCode, error: impl Into<String>) {
        self.emit(Frame::Error {
            upload_id,
            error: error.into(),
            code,
        });
    }

    /// Processes commands until the root token is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("supervisor started");
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match command {
                Command::Start {
                    file_path,
                    upload_id,
                    backend_url,
                } => self.handle_start(file_path, upload_id, backend_url, &cancel),
                Command::Pause => self.handle_pause(),
                Command::Resume => self.handle_resume(),
                Command::Cancel => self.handle_cancel(),
            }
        }

        // Root shutdown takes the active job down with it.
        if let Some(job) = self.active.take() {
            job.cancel.cancel();
            let _ = job.handle.await;
        }
        info!("supervisor stopped");
    }

    fn handle_start(
        &mut self,
        file_path: Option<String>,
        upload_id: Option<String>,
        backend_url: Option<String>,
        root: &CancellationToken,
    ) {
        if self.active.as_ref().is_some_and(|j| j.is_running()) {
            self.emit_error(
                None,
                ErrorCode::UploadInProgress,
                "another upload is already running",
            );
            return;
        }
        if file_path.is_none() && upload_id.is_none() {
            self.emit_error(None, ErrorCode::UploadError, "filePath is required");
            return;
        }

        let gate = PauseGate::new();
        let job_cancel = root.child_token();
        let (upload_id_tx, upload_id_rx) = watch::channel(None);

        let runner = JobRunner {
            cfg: self.cfg.clone(),
            store: Arc::clone(&self.store),
            http: self.http.clone(),
            events: self.events.clone(),
            gate: Arc::clone(&gate),
            cancel: job_cancel.clone(),
            upload_id_tx,
        };
        let handle = tokio::spawn(runner.run(file_path, upload_id, backend_url));

        self.active = Some(ActiveJob {
            upload_id_rx,
            gate,
            cancel: job_cancel,
            handle,
        });
    }

    fn handle_pause(&mut self) {
        let Some(job) = self.active.as_ref().filter(|j| j.is_running()) else {
            debug!("pause ignored: no active upload");
            return;
        };
        if job.gate.is_paused() {
            return;
        }
        job.gate.pause();
        let upload_id = job.upload_id();
        if let Some(id) = &upload_id {
            if let Err(e) = self.store.update_job_status(id, JobStatus::Paused) {
                warn!("could not persist paused status: {e}");
            }
        }
        self.emit(Frame::Status {
            upload_id,
            status: StatusKind::Paused,
            message: "upload paused".into(),
        });
    }

    fn handle_resume(&mut self) {
        let Some(job) = self.active.as_ref().filter(|j| j.is_running()) else {
            debug!("resume ignored: no active upload");
            return;
        };
        if !job.gate.is_paused() {
            return;
        }
        job.gate.resume();
        let upload_id = job.upload_id();
        if let Some(id) = &upload_id {
            if let Err(e) = self.store.update_job_status(id, JobStatus::InProgress) {
                warn!("could not persist resumed status: {e}");
            }
        }
        self.emit(Frame::Status {
            upload_id,
            status: StatusKind::Uploading,
            message: "upload resumed".into(),
        });
    }

    fn handle_cancel(&mut self) {
        match self.active.as_ref().filter(|j| j.is_running()) {
            Some(job) => {
                // Make sure paused workers can observe the cancellation.
                job.cancel.cancel();
                job.gate.resume();
            }
            None => debug!("cancel ignored: no active upload"),
        }
    }
}

/// Everything the prepare phase produces.
struct Prepared {
    job: UploadJob,
    source: Arc<SourceFile>,
    pending: Vec<PartRow>,
    resumed_bytes: u64,
}

/// One job's lifecycle, run on its own task.
struct JobRunner {
    cfg: AgentConfig,
    store: Arc<StateStore>,
    http: reqwest::Client,
    events: broadcast::Sender<Frame>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    upload_id_tx: watch::Sender<Option<String>>,
}

impl JobRunner {
    fn emit(&self, frame: Frame) {
        let _ = self.events.send(frame);
    }

    fn status(&self, upload_id: Option<String>, status: StatusKind, message: &str) {
        self.emit(Frame::Status {
            upload_id,
            status,
            message: message.into(),
        });
    }

    fn error(&self, upload_id: Option<String>, code: ErrorCode, error: impl Into<String>) {
        self.emit(Frame::Error {
            upload_id,
            error: error.into(),
            code,
        });
    }

    async fn run(
        self,
        file_path: Option<String>,
        upload_id: Option<String>,
        backend_url: Option<String>,
    ) {
        let coordinator = CoordinatorClient::new(
            self.http.clone(),
            backend_url.as_deref().unwrap_or(&self.cfg.backend_url),
        );

        self.status(None, StatusKind::Preparing, "preparing upload");
        let prepared = match self.prepare(&coordinator, file_path, upload_id).await {
            Ok(prepared) => prepared,
            Err((code, err)) => {
                warn!("prepare failed: {err}");
                self.error(None, code, err.to_string());
                return;
            }
        };

        let upload_id = prepared.job.upload_id.clone();
        let _ = self.upload_id_tx.send(Some(upload_id.clone()));
        info!(
            upload_id = %upload_id,
            parts = prepared.job.total_parts,
            part_size = prepared.job.part_size,
            "upload prepared"
        );

        self.upload(&coordinator, prepared).await;
    }

    /// Locks the file and either resumes a persisted job or initiates a
    /// new one. On failure the lock is dropped before returning.
    async fn prepare(
        &self,
        coordinator: &CoordinatorClient,
        file_path: Option<String>,
        upload_id: Option<String>,
    ) -> Result<Prepared, (ErrorCode, EngineError)> {
        // Resolve the job row first when resuming by id, so the file
        // path comes from the store.
        let stored = match &upload_id {
            Some(id) => {
                let job = self
                    .store
                    .get_job(id)
                    .map_err(|e| (ErrorCode::UploadError, e.into()))?;
                match job {
                    Some(job) if job.status.is_resumable() => Some(job),
                    _ => {
                        return Err((
                            ErrorCode::UploadError,
                            EngineError::Invalid(format!("no resumable upload {id}")),
                        ))
                    }
                }
            }
            None => None,
        };

        let path = match stored.as_ref().map(|j| j.file_path.clone()).or(file_path) {
            Some(path) => std::path::PathBuf::from(path),
            None => {
                return Err((
                    ErrorCode::UploadError,
                    EngineError::Invalid("filePath is required".into()),
                ))
            }
        };

        let source = SourceFile::lock(&path).map_err(|e| (ErrorCode::FileLockFailed, e))?;
        let fingerprint = source.fingerprint();

        // A matching unfinished job for this path means crash recovery.
        let resumable = match stored {
            Some(job) => Some(job),
            None => self
                .store
                .find_resumable(&path.to_string_lossy())
                .map_err(|e| (ErrorCode::UploadError, e.into()))?,
        };

        if let Some(job) = resumable {
            if job.fingerprint != fingerprint {
                return Err((
                    ErrorCode::UploadError,
                    EngineError::FingerprintMismatch {
                        expected: job.fingerprint,
                        actual: fingerprint,
                    },
                ));
            }
            let pending = self
                .store
                .get_pending(&job.upload_id, self.cfg.retry_max_attempts)
                .map_err(|e| (ErrorCode::UploadError, e.into()))?;
            let resumed_bytes = self
                .store
                .completed_bytes(&job.upload_id)
                .map_err(|e| (ErrorCode::UploadError, e.into()))?;
            info!(
                upload_id = %job.upload_id,
                pending = pending.len(),
                "resuming persisted upload"
            );
            return Ok(Prepared {
                job,
                source: Arc::new(source),
                pending,
                resumed_bytes,
            });
        }

        // Fresh upload: size parts locally before touching the network,
        // so an impossible file fails fast.
        let local_part_size = source::auto_part_size(source.size(), &self.cfg)
            .map_err(|e| (ErrorCode::UploadError, e))?;

        let initiated = coordinator
            .initiate(&source.file_name(), source.size(), &fingerprint)
            .await
            .map_err(|e| (ErrorCode::InitiateFailed, e))?;

        // The coordinator's sizing wins when it is workable; otherwise
        // fall back to the local plan.
        let part_size = if initiated.chunk_size >= self.cfg.min_part_size()
            && initiated.chunk_size <= self.cfg.max_part_size()
            && source.size().div_ceil(initiated.chunk_size.max(1))
                <= self.cfg.max_parts as u64
        {
            initiated.chunk_size
        } else {
            local_part_size
        };

        let parts = source::plan_parts(source.size(), part_size);
        let job = UploadJob {
            upload_id: initiated.upload_id.clone(),
            file_path: path.to_string_lossy().into_owned(),
            file_name: source.file_name(),
            file_size: source.size(),
            fingerprint,
            bucket: initiated.bucket,
            object_key: initiated.object_key,
            part_size,
            total_parts: parts.len() as u32,
            status: JobStatus::Pending,
            created_at: unix_timestamp(),
            completed_at: None,
        };
        self.store
            .create_upload(&job)
            .map_err(|e| (ErrorCode::UploadError, e.into()))?;

        let rows: Vec<PartRow> = parts
            .iter()
            .map(|p| PartRow {
                upload_id: job.upload_id.clone(),
                part_number: p.number,
                byte_offset: p.offset,
                byte_length: p.length,
                etag: None,
                status: PartStatus::Pending,
                retry_count: 0,
            })
            .collect();
        self.store
            .init_parts(&job.upload_id, &rows)
            .map_err(|e| (ErrorCode::UploadError, e.into()))?;

        Ok(Prepared {
            job,
            source: Arc::new(source),
            pending: rows,
            resumed_bytes: 0,
        })
    }

    /// The upload and finalize phases.
    async fn upload(&self, coordinator: &CoordinatorClient, prepared: Prepared) {
        let Prepared {
            job,
            source,
            pending,
            resumed_bytes,
        } = prepared;
        let upload_id = job.upload_id.clone();
        let job_ref = JobRef {
            upload_id: upload_id.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
        };

        if let Err(e) = self.store.update_job_status(&upload_id, JobStatus::InProgress) {
            self.error(Some(upload_id), ErrorCode::UploadError, e.to_string());
            return;
        }

        // Everything below runs under a child token so a clean drain can
        // stop the helpers without looking like a user cancel.
        let work_cancel = self.cancel.child_token();

        let urls = UrlPool::new(self.cfg.presign_lookahead);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = flume::unbounded();
        for part in &pending {
            let _ = refresh_tx.send(part.part_number);
            let _ = queue_tx.send(PartTask {
                number: part.part_number,
                offset: part.byte_offset,
                length: part.byte_length,
            });
        }

        let prefetcher = Prefetcher::new(
            coordinator.clone(),
            job_ref.clone(),
            Arc::clone(&urls),
            refresh_rx,
            self.cfg.presign_batch_size,
        );
        tokio::spawn(prefetcher.run(work_cancel.clone()));

        let counters = ProgressCounters::new(job.file_size, job.total_parts, resumed_bytes);
        tokio::spawn(progress::run_ticker(
            Arc::clone(&counters),
            Arc::clone(&self.store),
            upload_id.clone(),
            self.cfg.progress_interval(),
            self.events.clone(),
            work_cancel.clone(),
        ));

        let (remaining_tx, mut remaining_rx) = watch::channel(pending.len());
        let (gave_up_tx, gave_up_rx) = watch::channel(0usize);
        let store_fatal = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(WorkerContext {
            cfg: self.cfg.clone(),
            upload_id: upload_id.clone(),
            store: Arc::clone(&self.store),
            source: Arc::clone(&source),
            http: self.http.clone(),
            urls,
            url_refresh: refresh_tx,
            queue_tx,
            queue_rx,
            gate: Arc::clone(&self.gate),
            progress: Arc::clone(&counters),
            events: self.events.clone(),
            remaining: remaining_tx,
            gave_up: gave_up_tx,
            store_fatal: Arc::clone(&store_fatal),
            cancel: work_cancel.clone(),
        });

        let worker_count = self.cfg.effective_workers(
            job.part_size,
            config::cpu_cores(),
            config::available_memory(),
        );
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            workers.push(tokio::spawn(pool::run_worker(Arc::clone(&ctx))));
        }
        info!(upload_id = %upload_id, workers = worker_count, "upload started");
        self.status(Some(upload_id.clone()), StatusKind::Uploading, "uploading");

        // `work_cancel` fires on user cancel (parent propagation) and on
        // fatal store errors; `remaining` hitting zero is the clean drain.
        tokio::select! {
            _ = work_cancel.cancelled() => {}
            _ = remaining_rx.wait_for(|n| *n == 0) => {}
        }

        work_cancel.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        let cancelled = self.cancel.is_cancelled();

        if cancelled {
            self.finish_cancelled(coordinator, &job_ref).await;
            return;
        }
        if store_fatal.load(Ordering::SeqCst) {
            let _ = self.store.update_job_status(&upload_id, JobStatus::Failed);
            self.error(
                Some(upload_id),
                ErrorCode::UploadError,
                "state store write failed",
            );
            return;
        }

        let failed = *gave_up_rx.borrow();
        if failed > 0 {
            let _ = self.store.update_job_status(&upload_id, JobStatus::Failed);
            self.error(
                Some(upload_id),
                ErrorCode::Incomplete,
                EngineError::Incomplete {
                    failed: failed as u32,
                    total: job.total_parts,
                }
                .to_string(),
            );
            return;
        }

        self.finalize(coordinator, &job_ref, &job).await;
    }

    /// Calls `complete` with the ordered receipts.
    async fn finalize(&self, coordinator: &CoordinatorClient, job_ref: &JobRef, job: &UploadJob) {
        let upload_id = job.upload_id.clone();
        self.status(
            Some(upload_id.clone()),
            StatusKind::Verifying,
            "finalizing upload",
        );

        let receipts: Vec<PartReceipt> = match self.store.get_completed(&upload_id) {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    row.etag.map(|etag| PartReceipt {
                        part_number: row.part_number,
                        etag,
                    })
                })
                .collect(),
            Err(e) => {
                let _ = self.store.update_job_status(&upload_id, JobStatus::Failed);
                self.error(Some(upload_id), ErrorCode::UploadError, e.to_string());
                return;
            }
        };

        if receipts.len() as u32 != job.total_parts {
            let _ = self.store.update_job_status(&upload_id, JobStatus::Failed);
            self.error(
                Some(upload_id.clone()),
                ErrorCode::Incomplete,
                format!(
                    "only {} of {} receipts on record",
                    receipts.len(),
                    job.total_parts
                ),
            );
            return;
        }

        match coordinator.complete(job_ref, receipts).await {
            Ok(resp) => {
                let _ = self
                    .store
                    .update_job_status(&upload_id, JobStatus::Completed);
                info!(
                    upload_id = %upload_id,
                    final_etag = resp.final_etag.as_deref().unwrap_or(""),
                    "upload completed"
                );
                self.status(
                    Some(upload_id),
                    StatusKind::Completed,
                    "upload completed",
                );
            }
            Err(e) => {
                warn!("complete failed: {e}");
                if let Err(abort_err) = coordinator.abort(job_ref).await {
                    warn!("abort after failed complete also failed: {abort_err}");
                }
                let _ = self.store.update_job_status(&upload_id, JobStatus::Failed);
                self.error(Some(upload_id), ErrorCode::UploadError, e.to_string());
            }
        }
    }

    async fn finish_cancelled(&self, coordinator: &CoordinatorClient, job_ref: &JobRef) {
        let upload_id = job_ref.upload_id.clone();
        if let Err(e) = coordinator.abort(job_ref).await {
            warn!("abort failed: {e}");
        }
        let _ = self.store.update_job_status(&upload_id, JobStatus::Cancelled);
        info!(upload_id = %upload_id, "upload cancelled");
        self.status(
            Some(upload_id),
            StatusKind::Cancelled,
            "upload cancelled",
        );
    }
}
