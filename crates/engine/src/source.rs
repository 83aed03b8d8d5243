//! The locked source file: shared lock, fingerprint, positional reads,
//! and part planning.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::config::{AgentConfig, MIB};
use crate::EngineError;

/// Part sizes are aligned up to this granularity when auto-sizing.
const ALIGN: u64 = 16 * MIB;

/// One planned part: a contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based, contiguous.
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

/// Splits `[0, file_size)` into parts of `part_size` bytes; the final
/// part carries the remainder. An empty file yields one zero-length part
/// so the job lifecycle stays uniform.
pub fn plan_parts(file_size: u64, part_size: u64) -> Vec<PartSpec> {
    assert!(part_size > 0, "part_size must be positive");
    if file_size == 0 {
        return vec![PartSpec {
            number: 1,
            offset: 0,
            length: 0,
        }];
    }

    let total = file_size.div_ceil(part_size);
    (0..total)
        .map(|i| {
            let offset = i * part_size;
            PartSpec {
                number: (i + 1) as u32,
                offset,
                length: part_size.min(file_size - offset),
            }
        })
        .collect()
}

/// Chooses the part size for a file.
///
/// The configured size wins while it keeps the part count within
/// `max_parts`. Otherwise the minimum workable size is aligned up to the
/// next 16 MiB multiple and capped at `max_part_size`; if the cap still
/// cannot fit `max_parts`, the file is too large to upload.
pub fn auto_part_size(file_size: u64, cfg: &AgentConfig) -> Result<u64, EngineError> {
    let preferred = cfg
        .part_size_bytes
        .clamp(cfg.min_part_size(), cfg.max_part_size());

    if file_size.div_ceil(preferred) <= cfg.max_parts as u64 {
        return Ok(preferred);
    }

    let min_required = file_size.div_ceil(cfg.max_parts as u64);
    let aligned = (min_required / ALIGN + 1) * ALIGN;
    let chosen = aligned.min(cfg.max_part_size());

    let required_parts = file_size.div_ceil(chosen);
    if required_parts > cfg.max_parts as u64 {
        return Err(EngineError::PartCountOverflow {
            required_parts,
            max_parts: cfg.max_parts,
        });
    }
    Ok(chosen)
}

/// An open, lock-held handle on the file being uploaded.
///
/// The shared lock is the anti-tamper guarantee: it is taken at job
/// start and held until the job reaches a terminal state. Reads are
/// positional, so workers on any thread may call [`read_at`]
/// concurrently.
///
/// [`read_at`]: SourceFile::read_at
#[derive(Debug)]
pub struct SourceFile {
    file: File,
    path: PathBuf,
    size: u64,
    modified_ticks: i64,
}

impl SourceFile {
    /// Opens `path` read-only and takes a shared lock on it.
    pub fn lock(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::FileLock {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs2::FileExt::try_lock_shared(&file).map_err(|e| EngineError::FileLock {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let meta = file.metadata().map_err(|e| EngineError::FileLock {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let modified_ticks = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        debug!(path = %path.display(), size = meta.len(), "source file locked");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: meta.len(),
            modified_ticks,
        })
    }

    /// `"size:mtime_ticks"`: cheap identity, no content hashing.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.size, self.modified_ticks)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, lossy on non-UTF-8 names.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Reads exactly `length` bytes at `offset`, short only at EOF.
    pub fn read_at(&self, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;

        while filled < buf.len() {
            let n = read_at_raw(&self.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break; // EOF
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Drops the handle (and with it the lock).
    pub fn release(self) {
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "source file released");
    }
}

#[cfg(unix)]
fn read_at_raw(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at_raw(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}
