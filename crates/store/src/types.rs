//! Row types for the `uploads` and `parts` tables.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

/// Lifecycle status of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// A job in one of these states can be picked up again after a crash.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::InProgress | JobStatus::Paused
        )
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("bad job status: {s}").into()))
    }
}

/// Lifecycle status of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Pending => "pending",
            PartStatus::Uploading => "uploading",
            PartStatus::Completed => "completed",
            PartStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PartStatus::Pending),
            "uploading" => Some(PartStatus::Uploading),
            "completed" => Some(PartStatus::Completed),
            "failed" => Some(PartStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql for PartStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for PartStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        PartStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("bad part status: {s}").into()))
    }
}

/// One upload job.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub upload_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    /// `"size:mtime_ticks"`, used to detect file mutation across sessions.
    pub fingerprint: String,
    pub bucket: String,
    pub object_key: String,
    pub part_size: u64,
    pub total_parts: u32,
    pub status: JobStatus,
    /// Unix seconds.
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// One part of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PartRow {
    pub upload_id: String,
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    /// Storage receipt; present exactly when `status == Completed`.
    pub etag: Option<String>,
    pub status: PartStatus,
    /// Dispatch rounds consumed so far.
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("uploading"), None);
    }

    #[test]
    fn part_status_roundtrip() {
        for status in [
            PartStatus::Pending,
            PartStatus::Uploading,
            PartStatus::Completed,
            PartStatus::Failed,
        ] {
            assert_eq!(PartStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn resumable_states() {
        assert!(JobStatus::Pending.is_resumable());
        assert!(JobStatus::InProgress.is_resumable());
        assert!(JobStatus::Paused.is_resumable());
        assert!(!JobStatus::Completed.is_resumable());
        assert!(!JobStatus::Failed.is_resumable());
        assert!(!JobStatus::Cancelled.is_resumable());
    }
}
