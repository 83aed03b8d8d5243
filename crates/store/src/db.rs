//! SQLite-backed state store.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::types::{JobStatus, PartRow, PartStatus, UploadJob};
use crate::StoreError;

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    upload_id    TEXT PRIMARY KEY,
    file_path    TEXT NOT NULL,
    file_name    TEXT NOT NULL,
    file_size    INTEGER NOT NULL,
    fingerprint  TEXT NOT NULL,
    bucket       TEXT NOT NULL,
    object_key   TEXT NOT NULL,
    part_size    INTEGER NOT NULL,
    total_parts  INTEGER NOT NULL,
    status       TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE TABLE IF NOT EXISTS parts (
    upload_id    TEXT NOT NULL,
    part_number  INTEGER NOT NULL,
    byte_offset  INTEGER NOT NULL,
    byte_length  INTEGER NOT NULL,
    etag         TEXT,
    status       TEXT NOT NULL,
    retry_count  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (upload_id, part_number)
);
CREATE INDEX IF NOT EXISTS idx_parts_upload_status ON parts (upload_id, status);
";

/// Durable job/part store.
///
/// All access is serialized through one connection; callers on any thread
/// may invoke freely. Writes are committed (synchronous=FULL) before the
/// method returns.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new job row. Fails if the `upload_id` already exists.
    pub fn create_upload(&self, job: &UploadJob) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO uploads
             (upload_id, file_path, file_name, file_size, fingerprint, bucket,
              object_key, part_size, total_parts, status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.upload_id,
                job.file_path,
                job.file_name,
                job.file_size as i64,
                job.fingerprint,
                job.bucket,
                job.object_key,
                job.part_size as i64,
                job.total_parts,
                job.status,
                job.created_at,
                job.completed_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateUpload(job.upload_id.clone()));
        }
        Ok(())
    }

    /// Inserts every part row of a job in one transaction.
    pub fn init_parts(&self, upload_id: &str, parts: &[PartRow]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO parts
                 (upload_id, part_number, byte_offset, byte_length, etag, status, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for part in parts {
                stmt.execute(params![
                    upload_id,
                    part.part_number,
                    part.byte_offset as i64,
                    part.byte_length as i64,
                    part.etag,
                    part.status,
                    part.retry_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Marks a part as uploading. Idempotent; a completed part keeps its
    /// receipt and status.
    pub fn mark_uploading(&self, upload_id: &str, part: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE parts SET status = ?1
             WHERE upload_id = ?2 AND part_number = ?3 AND status != ?4",
            params![PartStatus::Uploading, upload_id, part, PartStatus::Completed],
        )?;
        if n == 0 {
            let exists: u32 = conn.query_row(
                "SELECT COUNT(*) FROM parts WHERE upload_id = ?1 AND part_number = ?2",
                params![upload_id, part],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(StoreError::PartNotFound {
                    upload_id: upload_id.into(),
                    part,
                });
            }
        }
        Ok(())
    }

    /// Records a part's receipt.
    ///
    /// Re-recording the same etag is a no-op; a different etag on an
    /// already-completed part is refused.
    pub fn mark_completed(
        &self,
        upload_id: &str,
        part: u32,
        etag: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<(PartStatus, Option<String>)> = conn
            .query_row(
                "SELECT status, etag FROM parts WHERE upload_id = ?1 AND part_number = ?2",
                params![upload_id, part],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => Err(StoreError::PartNotFound {
                upload_id: upload_id.into(),
                part,
            }),
            Some((PartStatus::Completed, Some(recorded))) if recorded != etag => {
                Err(StoreError::ReceiptConflict {
                    upload_id: upload_id.into(),
                    part,
                })
            }
            Some((PartStatus::Completed, _)) => Ok(()),
            Some(_) => {
                conn.execute(
                    "UPDATE parts SET status = ?1, etag = ?2
                     WHERE upload_id = ?3 AND part_number = ?4",
                    params![PartStatus::Completed, etag, upload_id, part],
                )?;
                Ok(())
            }
        }
    }

    /// Marks a part as failed and bumps its retry count. Returns the new
    /// retry count. Completed parts are left untouched.
    pub fn mark_failed(&self, upload_id: &str, part: u32) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE parts SET status = ?1, retry_count = retry_count + 1
             WHERE upload_id = ?2 AND part_number = ?3 AND status != ?4",
            params![
                PartStatus::Failed,
                upload_id,
                part,
                PartStatus::Completed
            ],
        )?;
        if n == 0 {
            return Err(StoreError::PartNotFound {
                upload_id: upload_id.into(),
                part,
            });
        }
        let count = conn.query_row(
            "SELECT retry_count FROM parts WHERE upload_id = ?1 AND part_number = ?2",
            params![upload_id, part],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Rows still needing work: pending or failed with retry budget left,
    /// in ascending part order.
    pub fn get_pending(&self, upload_id: &str, max_retries: u32) -> Result<Vec<PartRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT upload_id, part_number, byte_offset, byte_length, etag, status, retry_count
             FROM parts
             WHERE upload_id = ?1
               AND status IN ('pending', 'uploading', 'failed')
               AND retry_count < ?2
             ORDER BY part_number",
        )?;
        let rows = stmt
            .query_map(params![upload_id, max_retries], row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Completed rows with their receipts, in ascending part order.
    pub fn get_completed(&self, upload_id: &str) -> Result<Vec<PartRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT upload_id, part_number, byte_offset, byte_length, etag, status, retry_count
             FROM parts
             WHERE upload_id = ?1 AND status = 'completed'
             ORDER BY part_number",
        )?;
        let rows = stmt
            .query_map(params![upload_id], row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of completed parts.
    pub fn count_completed(&self, upload_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM parts WHERE upload_id = ?1 AND status = 'completed'",
            params![upload_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sum of completed part lengths, for resuming the byte counter.
    pub fn completed_bytes(&self, upload_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_length), 0) FROM parts
             WHERE upload_id = ?1 AND status = 'completed'",
            params![upload_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Updates a job's status; stamps `completed_at` on terminal states.
    pub fn update_job_status(&self, upload_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let completed_at = match status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                Some(unix_timestamp())
            }
            _ => None,
        };
        let n = conn.execute(
            "UPDATE uploads SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE upload_id = ?3",
            params![status, completed_at, upload_id],
        )?;
        if n == 0 {
            return Err(StoreError::UploadNotFound(upload_id.into()));
        }
        Ok(())
    }

    /// Fetches a job by id.
    pub fn get_job(&self, upload_id: &str) -> Result<Option<UploadJob>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT upload_id, file_path, file_name, file_size, fingerprint, bucket,
                        object_key, part_size, total_parts, status, created_at, completed_at
                 FROM uploads WHERE upload_id = ?1",
                params![upload_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// The most recent non-terminal job for `file_path`, if any.
    pub fn find_resumable(&self, file_path: &str) -> Result<Option<UploadJob>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT upload_id, file_path, file_name, file_size, fingerprint, bucket,
                        object_key, part_size, total_parts, status, created_at, completed_at
                 FROM uploads
                 WHERE file_path = ?1 AND status IN ('pending', 'in_progress', 'paused')
                 ORDER BY created_at DESC LIMIT 1",
                params![file_path],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Removes a job and all of its part rows.
    pub fn delete_job(&self, upload_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM parts WHERE upload_id = ?1", params![upload_id])?;
        tx.execute(
            "DELETE FROM uploads WHERE upload_id = ?1",
            params![upload_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn row_to_part(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartRow> {
    Ok(PartRow {
        upload_id: row.get(0)?,
        part_number: row.get(1)?,
        byte_offset: row.get::<_, i64>(2)? as u64,
        byte_length: row.get::<_, i64>(3)? as u64,
        etag: row.get(4)?,
        status: row.get(5)?,
        retry_count: row.get(6)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadJob> {
    Ok(UploadJob {
        upload_id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        fingerprint: row.get(4)?,
        bucket: row.get(5)?,
        object_key: row.get(6)?,
        part_size: row.get::<_, i64>(7)? as u64,
        total_parts: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str) -> UploadJob {
        UploadJob {
            upload_id: id.into(),
            file_path: "/data/big.iso".into(),
            file_name: "big.iso".into(),
            file_size: 300,
            fingerprint: "300:123456789".into(),
            bucket: "uploads".into(),
            object_key: "20260101_big.iso".into(),
            part_size: 100,
            total_parts: 3,
            status: JobStatus::Pending,
            created_at: unix_timestamp(),
            completed_at: None,
        }
    }

    fn sample_parts(id: &str, total: u32, part_size: u64) -> Vec<PartRow> {
        (1..=total)
            .map(|n| PartRow {
                upload_id: id.into(),
                part_number: n,
                byte_offset: (n as u64 - 1) * part_size,
                byte_length: part_size,
                etag: None,
                status: PartStatus::Pending,
                retry_count: 0,
            })
            .collect()
    }

    fn store_with_job(id: &str) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store.create_upload(&sample_job(id)).unwrap();
        store.init_parts(id, &sample_parts(id, 3, 100)).unwrap();
        store
    }

    #[test]
    fn create_upload_rejects_duplicate() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_upload(&sample_job("u1")).unwrap();
        let err = store.create_upload(&sample_job("u1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUpload(_)));
    }

    #[test]
    fn init_parts_is_atomic_batch() {
        let store = store_with_job("u1");
        let pending = store.get_pending("u1", 3).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(
            pending.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(pending[2].byte_offset, 200);
    }

    #[test]
    fn mark_completed_sets_etag() {
        let store = store_with_job("u1");
        store.mark_uploading("u1", 2).unwrap();
        store.mark_completed("u1", 2, "\"abc\"").unwrap();

        let completed = store.get_completed("u1").unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].part_number, 2);
        assert_eq!(completed[0].etag.as_deref(), Some("\"abc\""));
        assert_eq!(store.count_completed("u1").unwrap(), 1);
    }

    #[test]
    fn mark_completed_idempotent_same_etag() {
        let store = store_with_job("u1");
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        assert_eq!(store.count_completed("u1").unwrap(), 1);
    }

    #[test]
    fn mark_completed_refuses_conflicting_etag() {
        let store = store_with_job("u1");
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        let err = store.mark_completed("u1", 1, "\"y\"").unwrap_err();
        assert!(matches!(err, StoreError::ReceiptConflict { part: 1, .. }));
    }

    #[test]
    fn mark_uploading_preserves_completed_parts() {
        let store = store_with_job("u1");
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        store.mark_uploading("u1", 1).unwrap();
        let completed = store.get_completed("u1").unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].etag.as_deref(), Some("\"x\""));
    }

    #[test]
    fn mark_failed_bumps_retry_count() {
        let store = store_with_job("u1");
        assert_eq!(store.mark_failed("u1", 3).unwrap(), 1);
        assert_eq!(store.mark_failed("u1", 3).unwrap(), 2);
    }

    #[test]
    fn mark_failed_leaves_completed_parts_alone() {
        let store = store_with_job("u1");
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        let err = store.mark_failed("u1", 1).unwrap_err();
        assert!(matches!(err, StoreError::PartNotFound { .. }));
        assert_eq!(store.count_completed("u1").unwrap(), 1);
    }

    #[test]
    fn get_pending_excludes_exhausted_and_completed() {
        let store = store_with_job("u1");
        store.mark_completed("u1", 1, "\"x\"").unwrap();
        // Part 2 burns through its retry budget.
        store.mark_failed("u1", 2).unwrap();
        store.mark_failed("u1", 2).unwrap();

        let pending = store.get_pending("u1", 2).unwrap();
        assert_eq!(
            pending.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![3]
        );
        // With budget left, the failed part is still eligible.
        let pending = store.get_pending("u1", 3).unwrap();
        assert_eq!(
            pending.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn completed_bytes_sums_lengths() {
        let store = store_with_job("u1");
        assert_eq!(store.completed_bytes("u1").unwrap(), 0);
        store.mark_completed("u1", 1, "\"a\"").unwrap();
        store.mark_completed("u1", 3, "\"b\"").unwrap();
        assert_eq!(store.completed_bytes("u1").unwrap(), 200);
    }

    #[test]
    fn update_job_status_stamps_terminal_time() {
        let store = store_with_job("u1");
        store
            .update_job_status("u1", JobStatus::InProgress)
            .unwrap();
        assert!(store.get_job("u1").unwrap().unwrap().completed_at.is_none());

        store.update_job_status("u1", JobStatus::Completed).unwrap();
        let job = store.get_job("u1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn update_job_status_unknown_id() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update_job_status("missing", JobStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, StoreError::UploadNotFound(_)));
    }

    #[test]
    fn find_resumable_skips_terminal_jobs() {
        let store = store_with_job("u1");
        assert!(store.find_resumable("/data/big.iso").unwrap().is_some());

        store.update_job_status("u1", JobStatus::Cancelled).unwrap();
        assert!(store.find_resumable("/data/big.iso").unwrap().is_none());
        assert!(store.find_resumable("/other/path").unwrap().is_none());
    }

    #[test]
    fn delete_job_removes_parts() {
        let store = store_with_job("u1");
        store.delete_job("u1").unwrap();
        assert!(store.get_job("u1").unwrap().is_none());
        assert!(store.get_pending("u1", 3).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = StateStore::open(&path).unwrap();
            store.create_upload(&sample_job("u1")).unwrap();
            store.init_parts("u1", &sample_parts("u1", 3, 100)).unwrap();
            store.mark_completed("u1", 2, "\"etag-2\"").unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let job = store.get_job("u1").unwrap().unwrap();
        assert_eq!(job.total_parts, 3);
        let pending = store.get_pending("u1", 3).unwrap();
        assert_eq!(
            pending.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
        let completed = store.get_completed("u1").unwrap();
        assert_eq!(completed[0].etag.as_deref(), Some("\"etag-2\""));
    }
}
