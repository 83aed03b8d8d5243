//! Engine tunables, frozen at construction.

use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Immutable configuration snapshot for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Target part size; may be raised by auto-sizing.
    pub part_size_bytes: u64,
    /// Storage-imposed lower bound on part size.
    pub min_part_size_mib: u64,
    /// Self-imposed upper bound on part size.
    pub max_part_size_mib: u64,
    /// Storage-imposed cap on part count.
    pub max_parts: u32,

    pub workers_min: usize,
    pub workers_max: usize,
    /// When set, worker count is derived from the host; otherwise
    /// `workers_max` is used as-is.
    pub workers_auto: bool,

    /// Parts per presign request.
    pub presign_batch_size: usize,
    /// High watermark of the prefetched-URL pool.
    pub presign_lookahead: usize,

    /// Inline attempts per dispatch, and global requeue rounds per part.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Per-part PUT deadline.
    pub http_timeout_s: u64,
    /// Progress push cadence.
    pub progress_interval_ms: u64,

    pub ws_port: u16,
    pub backend_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: 128 * MIB,
            min_part_size_mib: 5,
            max_part_size_mib: 512,
            max_parts: 10_000,
            workers_min: 1,
            workers_max: 8,
            workers_auto: true,
            presign_batch_size: 20,
            presign_lookahead: 50,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            http_timeout_s: 300,
            progress_interval_ms: 500,
            ws_port: 8765,
            backend_url: "http://localhost:8000".into(),
        }
    }
}

impl AgentConfig {
    pub fn min_part_size(&self) -> u64 {
        self.min_part_size_mib * MIB
    }

    pub fn max_part_size(&self) -> u64 {
        self.max_part_size_mib * MIB
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_s)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Backoff before inline attempt `n` (0-indexed): `min(base × 2^n, max)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_base_delay_ms;
        let delay = base
            .checked_shl(attempt)
            .unwrap_or(self.retry_max_delay_ms)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Number of workers for this host.
    ///
    /// Auto mode takes 3/4 of the cores, clamps to `[workers_min,
    /// workers_max]`, then shrinks until `workers × part_size` fits in
    /// half the available memory (when known).
    pub fn effective_workers(&self, part_size: u64, cpu_cores: usize, available_memory: Option<u64>) -> usize {
        let floor = self.workers_min.max(1);
        let ceiling = self.workers_max.max(floor);
        let mut workers = if self.workers_auto {
            let by_cpu = (cpu_cores * 3) / 4;
            by_cpu.clamp(floor, ceiling)
        } else {
            ceiling
        };

        if let Some(mem) = available_memory {
            let budget = mem / 2;
            while workers > floor && (workers as u64) * part_size > budget {
                workers -= 1;
            }
        }
        workers
    }
}

/// Logical CPU count.
pub fn cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Bytes of memory the kernel reports as available, if we can tell.
#[cfg(target_os = "linux")]
pub fn available_memory() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn available_memory() -> Option<u64> {
    None
}
