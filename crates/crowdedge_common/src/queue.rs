//! Offline queue - SQLite-backed store for outbound records.
//!
//! Holds portal submissions and analytics records while the backend is
//! unreachable. Submissions always drain before analytics; within a kind
//! the order is first-in-first-out. Analytics overflow evicts the oldest
//! record, submission overflow is rejected so human data is never
//! silently dropped.
//!
//! The queue is written by two independent processes (the agent's sync
//! path and the portal's submission handler); SQLite's own locking
//! serializes them, every operation here being a single short
//! transaction. A busy database surfaces as a transient storage error.

use crate::error::{EdgeError, EdgeResult};
use crate::identity::QUEUE_DB_PATH;
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Queue item kinds; the numeric value doubles as the drain priority
/// (lower drains first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Portal submission - highest priority, capped, never evicted.
    Submission = 1,
    /// Analytics record - lower priority, oldest evicted on overflow.
    Analytics = 2,
}

impl QueueKind {
    pub fn priority(self) -> i64 {
        self as i64
    }

    fn from_i64(value: i64) -> EdgeResult<Self> {
        match value {
            1 => Ok(QueueKind::Submission),
            2 => Ok(QueueKind::Analytics),
            other => Err(EdgeError::Internal(format!("unknown queue kind {}", other))),
        }
    }
}

/// Storage caps per kind. Injectable so tests can exercise overflow
/// without thousands of rows.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_analytics: usize,
    pub max_submissions: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_analytics: 10_000,
            max_submissions: 1_000,
        }
    }
}

/// A queued outbound record.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub kind: QueueKind,
    pub payload: serde_json::Value,
    pub created_at: String,
    pub retry_count: i64,
    pub last_retry_at: Option<String>,
}

/// Queue depth and size snapshot, reported in heartbeat telemetry.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub analytics_count: u64,
    pub submission_count: u64,
    pub total_count: u64,
    pub size_bytes: u64,
}

/// SQLite-backed offline queue.
pub struct OfflineQueue {
    conn: Connection,
    path: PathBuf,
    limits: QueueLimits,
}

impl OfflineQueue {
    /// Open or create the queue database at the default path.
    pub fn open() -> EdgeResult<Self> {
        Self::open_at(QUEUE_DB_PATH)
    }

    /// Open at a specific path with default limits.
    pub fn open_at<P: AsRef<Path>>(path: P) -> EdgeResult<Self> {
        Self::open_with_limits(path, QueueLimits::default())
    }

    /// Open at a specific path with explicit limits (for testing).
    pub fn open_with_limits<P: AsRef<Path>>(path: P, limits: QueueLimits) -> EdgeResult<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path_ref)?;

        // WAL so the portal process and the agent can write concurrently
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_priority
                ON queue_items(priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_queue_kind
                ON queue_items(kind);
            "#,
        )?;

        info!("Opened offline queue at {}", path_ref.display());

        Ok(Self {
            conn,
            path: path_ref.to_path_buf(),
            limits,
        })
    }

    /// Enqueue an analytics record. Never fails for capacity: at the cap
    /// the single oldest analytics record is evicted first.
    pub fn enqueue_analytics(&self, payload: &serde_json::Value) -> EdgeResult<i64> {
        let tx = self.conn.unchecked_transaction()?;

        let count = count_kind(&tx, QueueKind::Analytics)?;
        if count >= self.limits.max_analytics as u64 {
            warn!("Analytics queue full ({}), evicting oldest record", count);
            tx.execute(
                "DELETE FROM queue_items
                 WHERE id = (
                     SELECT id FROM queue_items
                     WHERE kind = ?1
                     ORDER BY created_at ASC, id ASC
                     LIMIT 1
                 )",
                params![QueueKind::Analytics.priority()],
            )?;
        }

        let id = insert_item(&tx, QueueKind::Analytics, payload)?;
        tx.commit()?;
        debug!("Enqueued analytics record {}", id);
        Ok(id)
    }

    /// Enqueue a portal submission. At the cap this fails with a
    /// capacity error and inserts nothing; the portal surfaces the
    /// failure to the visitor instead of dropping their registration.
    pub fn enqueue_submission(&self, payload: &serde_json::Value) -> EdgeResult<i64> {
        let tx = self.conn.unchecked_transaction()?;

        let count = count_kind(&tx, QueueKind::Submission)?;
        if count >= self.limits.max_submissions as u64 {
            return Err(EdgeError::Capacity {
                limit: self.limits.max_submissions,
            });
        }

        let id = insert_item(&tx, QueueKind::Submission, payload)?;
        tx.commit()?;
        info!("Enqueued portal submission {}", id);
        Ok(id)
    }

    /// Read up to `max_items` items in drain order: submissions before
    /// analytics regardless of age, oldest first within a kind. Items
    /// are not removed; callers confirm with `mark_synced`.
    pub fn dequeue_batch(&self, max_items: usize) -> EdgeResult<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, payload, created_at, retry_count, last_retry_at
             FROM queue_items
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![max_items as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, kind, payload, created_at, retry_count, last_retry_at) = row?;
            items.push(QueueItem {
                id,
                kind: QueueKind::from_i64(kind)?,
                payload: serde_json::from_str(&payload)?,
                created_at,
                retry_count,
                last_retry_at,
            });
        }

        debug!("Dequeued {} items", items.len());
        Ok(items)
    }

    /// Delete confirmed-synced items. Ids already removed are a no-op.
    pub fn mark_synced(&self, ids: &[i64]) -> EdgeResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM queue_items WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        info!("Marked {} items as synced", ids.len());
        Ok(())
    }

    /// Record a failed sync attempt; items stay queued for a later batch.
    pub fn mark_failed(&self, ids: &[i64]) -> EdgeResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let now = now_timestamp();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE queue_items
                 SET retry_count = retry_count + 1, last_retry_at = ?1
                 WHERE id = ?2",
            )?;
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        warn!("Marked {} items as failed", ids.len());
        Ok(())
    }

    /// Queue depth and on-disk size.
    pub fn stats(&self) -> EdgeResult<QueueStats> {
        let mut stats = QueueStats::default();

        let mut stmt = self
            .conn
            .prepare("SELECT kind, COUNT(*) FROM queue_items GROUP BY kind")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        for row in rows {
            let (kind, count) = row?;
            match QueueKind::from_i64(kind)? {
                QueueKind::Analytics => stats.analytics_count = count as u64,
                QueueKind::Submission => stats.submission_count = count as u64,
            }
            stats.total_count += count as u64;
        }

        stats.size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(stats)
    }

    /// Delete items older than the cutoff, regardless of sync or retry
    /// state. This deliberately discards records that never managed to
    /// sync: the queue is a bounded cache, not an archive, and a record
    /// stuck for this long is stale enough to purge.
    pub fn cleanup_older_than(&self, days: i64) -> EdgeResult<usize> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Micros, true);

        let deleted = self
            .conn
            .execute("DELETE FROM queue_items WHERE created_at < ?1", params![cutoff])?;

        if deleted > 0 {
            warn!("Purged {} queue items older than {} days", deleted, days);
        }
        Ok(deleted)
    }
}

fn count_kind(conn: &Connection, kind: QueueKind) -> EdgeResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_items WHERE kind = ?1",
        params![kind.priority()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn insert_item(conn: &Connection, kind: QueueKind, payload: &serde_json::Value) -> EdgeResult<i64> {
    conn.execute(
        "INSERT INTO queue_items (kind, priority, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            kind.priority(),
            kind.priority(),
            serde_json::to_string(payload)?,
            now_timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn test_queue() -> (OfflineQueue, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let queue = OfflineQueue::open_at(tmp.path()).unwrap();
        (queue, tmp)
    }

    #[test]
    fn test_submissions_drain_before_analytics() {
        let (queue, _tmp) = test_queue();

        queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        queue.enqueue_analytics(&json!({"n": 2})).unwrap();
        queue.enqueue_analytics(&json!({"n": 3})).unwrap();
        let s1 = queue.enqueue_submission(&json!({"name": "visitor"})).unwrap();

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].id, s1);
        assert_eq!(batch[0].kind, QueueKind::Submission);
        assert_eq!(batch[1].payload["n"], 1);
        assert_eq!(batch[2].payload["n"], 2);
        assert_eq!(batch[3].payload["n"], 3);
    }

    #[test]
    fn test_fifo_within_kind() {
        let (queue, _tmp) = test_queue();

        let ids: Vec<i64> = (0..5)
            .map(|n| queue.enqueue_analytics(&json!({"n": n})).unwrap())
            .collect();

        let batch = queue.dequeue_batch(10).unwrap();
        let got: Vec<i64> = batch.iter().map(|i| i.id).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn test_analytics_eviction_at_cap() {
        let tmp = NamedTempFile::new().unwrap();
        let limits = QueueLimits {
            max_analytics: 2,
            max_submissions: 10,
        };
        let queue = OfflineQueue::open_with_limits(tmp.path(), limits).unwrap();

        queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        queue.enqueue_analytics(&json!({"n": 2})).unwrap();
        queue.enqueue_analytics(&json!({"n": 3})).unwrap();

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload["n"], 2);
        assert_eq!(batch[1].payload["n"], 3);
    }

    #[test]
    fn test_submission_capacity_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let limits = QueueLimits {
            max_analytics: 10,
            max_submissions: 1,
        };
        let queue = OfflineQueue::open_with_limits(tmp.path(), limits).unwrap();

        queue.enqueue_submission(&json!({"name": "first"})).unwrap();
        let err = queue.enqueue_submission(&json!({"name": "second"})).unwrap_err();
        assert!(matches!(err, EdgeError::Capacity { limit: 1 }));

        // Nothing was inserted and nothing was evicted.
        let stats = queue.stats().unwrap();
        assert_eq!(stats.submission_count, 1);
    }

    #[test]
    fn test_mark_synced_removes_items() {
        let (queue, _tmp) = test_queue();

        let a = queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        let b = queue.enqueue_analytics(&json!({"n": 2})).unwrap();

        queue.mark_synced(&[a]).unwrap();
        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, b);

        // Already-removed ids are a no-op.
        queue.mark_synced(&[a]).unwrap();
    }

    #[test]
    fn test_mark_failed_increments_retry() {
        let (queue, _tmp) = test_queue();

        let id = queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        queue.mark_failed(&[id]).unwrap();

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].retry_count, 1);
        assert!(batch[0].last_retry_at.is_some());

        queue.mark_failed(&[id]).unwrap();
        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch[0].retry_count, 2);
    }

    #[test]
    fn test_cleanup_purges_regardless_of_retry_state() {
        let (queue, _tmp) = test_queue();

        let id = queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        queue.mark_failed(&[id]).unwrap();

        // Backdate the row past the cutoff.
        queue
            .conn
            .execute(
                "UPDATE queue_items SET created_at = '2020-01-01T00:00:00.000000Z' WHERE id = ?1",
                params![id],
            )
            .unwrap();

        let deleted = queue.cleanup_older_than(7).unwrap();
        assert_eq!(deleted, 1);
        assert!(queue.dequeue_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_keeps_fresh_items() {
        let (queue, _tmp) = test_queue();
        queue.enqueue_submission(&json!({"name": "visitor"})).unwrap();

        assert_eq!(queue.cleanup_older_than(7).unwrap(), 0);
        assert_eq!(queue.stats().unwrap().submission_count, 1);
    }

    #[test]
    fn test_stats_counts_by_kind() {
        let (queue, _tmp) = test_queue();

        queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        queue.enqueue_analytics(&json!({"n": 2})).unwrap();
        queue.enqueue_submission(&json!({"name": "visitor"})).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.analytics_count, 2);
        assert_eq!(stats.submission_count, 1);
        assert_eq!(stats.total_count, 3);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_dequeue_does_not_remove() {
        let (queue, _tmp) = test_queue();

        queue.enqueue_analytics(&json!({"n": 1})).unwrap();
        assert_eq!(queue.dequeue_batch(10).unwrap().len(), 1);
        assert_eq!(queue.dequeue_batch(10).unwrap().len(), 1);
    }
}
