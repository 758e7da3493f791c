use std::time::Duration;

use chrono::Utc;
use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

pub const QUEUE_NOTIFICATION: &str = "notification";
pub const QUEUE_AI: &str = "ai";
pub const QUEUE_REFLECT: &str = "reflect";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_DEAD: &str = "dead";

/// Highest queue priority. Lower numbers are served first.
pub const PRIORITY_TOP: i32 = 1;
pub const PRIORITY_DEFAULT: i32 = 5;
pub const PRIORITY_RETRO: i32 = 8;
pub const PRIORITY_BULK: i32 = 10;

#[derive(Debug, Clone)]
pub struct DbQueueItem {
    pub id: i64,
    pub queue: String,
    pub user_id: String,
    pub payload: String,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_visible_at: String,
    pub lease_expires_at: Option<String>,
    pub worker: Option<String>,
    pub error: Option<String>,
    pub dedup_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
}

/// Exponential backoff for retryable failures: 2^attempts seconds, capped.
pub fn backoff_secs(attempts: i32) -> u64 {
    let attempts = attempts.clamp(0, 10) as u32;
    2u64.saturating_pow(attempts).min(900)
}

impl Metastore {
    /// Enqueue an item. Idempotent when `dedup_key` is given: a pending or
    /// in-flight duplicate is not re-created, but its priority is raised to
    /// the stronger of the two.
    pub fn enqueue_item(
        &self,
        queue: &str,
        user_id: &str,
        payload: &str,
        priority: i32,
        max_attempts: i32,
        dedup_key: Option<&str>,
    ) -> Result<i64, DbError> {
        let now = now_rfc3339();

        if let Some(key) = dedup_key {
            let existing: Option<(i64, i32)> = self
                .conn_ref()
                .query_row(
                    "SELECT id, priority FROM queue_items
                     WHERE queue = ?1 AND dedup_key = ?2
                       AND status IN ('pending', 'processing')",
                    params![queue, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            if let Some((id, existing_priority)) = existing {
                if priority < existing_priority {
                    self.conn_ref().execute(
                        "UPDATE queue_items SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                        params![priority, now, id],
                    )?;
                }
                return Ok(id);
            }
        }

        self.conn_ref().execute(
            "INSERT INTO queue_items (
                queue, user_id, payload, priority, status, attempts,
                max_attempts, next_visible_at, dedup_key, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?6, ?6)",
            params![queue, user_id, payload, priority, max_attempts, now, dedup_key],
        )?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    /// Reserve up to `n` visible items under a lease. Reservation is atomic:
    /// items move to `processing` with this worker's name and an expiry, so
    /// no other worker can hold them until the lease lapses.
    ///
    /// Expired leases are reclaimed first; their items become visible again
    /// (or dead, if their attempts are already spent).
    pub fn reserve_items(
        &self,
        queue: &str,
        worker: &str,
        n: usize,
        lease: Duration,
    ) -> Result<Vec<DbQueueItem>, DbError> {
        self.with_transaction(|s| {
            let now = Utc::now();
            let now_str = now.to_rfc3339();

            // Reclaim lapsed leases
            s.conn_ref().execute(
                "UPDATE queue_items
                 SET status = CASE WHEN attempts >= max_attempts THEN 'dead' ELSE 'pending' END,
                     worker = NULL, lease_expires_at = NULL, updated_at = ?1
                 WHERE queue = ?2 AND status = 'processing' AND lease_expires_at < ?1",
                params![now_str, queue],
            )?;

            let candidates: Vec<i64> = {
                let mut stmt = s.conn_ref().prepare(
                    "SELECT id FROM queue_items
                     WHERE queue = ?1 AND status = 'pending' AND next_visible_at <= ?2
                     ORDER BY priority ASC, created_at ASC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![queue, now_str, n as i64], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let lease_until = (now + chrono::Duration::seconds(lease.as_secs() as i64)).to_rfc3339();
            let mut reserved = Vec::with_capacity(candidates.len());
            for id in candidates {
                s.conn_ref().execute(
                    "UPDATE queue_items
                     SET status = 'processing', worker = ?1, lease_expires_at = ?2,
                         attempts = attempts + 1, updated_at = ?3
                     WHERE id = ?4",
                    params![worker, lease_until, now_str, id],
                )?;
                if let Some(item) = s.get_queue_item(id)? {
                    reserved.push(item);
                }
            }
            Ok(reserved)
        })
    }

    pub fn get_queue_item(&self, id: i64) -> Result<Option<DbQueueItem>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT * FROM queue_items WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], map_queue_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn complete_item(&self, id: i64) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE queue_items
             SET status = 'completed', worker = NULL, lease_expires_at = NULL,
                 error = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Fail an item. Retryable failures defer visibility by `delay` (or the
    /// exponential backoff for the attempt count); exhausted or permanent
    /// failures go to `dead` and are never auto-replayed.
    pub fn fail_item(
        &self,
        id: i64,
        error: &str,
        retryable: bool,
        delay: Option<Duration>,
    ) -> Result<(), DbError> {
        let item = self
            .get_queue_item(id)?
            .ok_or_else(|| DbError::NotFound(format!("queue item {id}")))?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        if !retryable || item.attempts >= item.max_attempts {
            self.conn_ref().execute(
                "UPDATE queue_items
                 SET status = 'dead', worker = NULL, lease_expires_at = NULL,
                     error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_str, id],
            )?;
            return Ok(());
        }

        let delay = delay.unwrap_or_else(|| Duration::from_secs(backoff_secs(item.attempts)));
        let visible_at = (now + chrono::Duration::seconds(delay.as_secs() as i64)).to_rfc3339();
        self.conn_ref().execute(
            "UPDATE queue_items
             SET status = 'pending', worker = NULL, lease_expires_at = NULL,
                 error = ?1, next_visible_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![error, visible_at, now_str, id],
        )?;
        Ok(())
    }

    /// Extend a held lease (backpressure: slow handoff without losing the item).
    pub fn extend_lease(&self, id: i64, lease: Duration) -> Result<(), DbError> {
        let until = (Utc::now() + chrono::Duration::seconds(lease.as_secs() as i64)).to_rfc3339();
        self.conn_ref().execute(
            "UPDATE queue_items SET lease_expires_at = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            params![until, now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Release every reservation held by `worker` without consuming an
    /// attempt. Called on graceful shutdown so in-flight items are not lost.
    pub fn release_worker_leases(&self, worker: &str) -> Result<usize, DbError> {
        let now = now_rfc3339();
        let released = self.conn_ref().execute(
            "UPDATE queue_items
             SET status = 'pending', worker = NULL, lease_expires_at = NULL,
                 attempts = MAX(attempts - 1, 0), updated_at = ?1
             WHERE worker = ?2 AND status = 'processing'",
            params![now, worker],
        )?;
        Ok(released)
    }

    /// Release in-flight items for one user (credentials expired mid-batch).
    pub fn release_user_leases(&self, user_id: &str, queue: &str) -> Result<usize, DbError> {
        let now = now_rfc3339();
        let released = self.conn_ref().execute(
            "UPDATE queue_items
             SET status = 'pending', worker = NULL, lease_expires_at = NULL,
                 attempts = MAX(attempts - 1, 0), updated_at = ?1
             WHERE user_id = ?2 AND queue = ?3 AND status = 'processing'",
            params![now, user_id, queue],
        )?;
        Ok(released)
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats, DbError> {
        let mut stats = QueueStats::default();
        let mut stmt = self.conn_ref().prepare(
            "SELECT status, COUNT(*) FROM queue_items WHERE queue = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                STATUS_PENDING => stats.pending = count,
                STATUS_PROCESSING => stats.processing = count,
                STATUS_COMPLETED => stats.completed = count,
                STATUS_DEAD => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Dead items for operator inspection. Never auto-replayed.
    pub fn list_dead_items(&self, queue: &str, limit: usize) -> Result<Vec<DbQueueItem>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM queue_items WHERE queue = ?1 AND status = 'dead'
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![queue, limit as i64], map_queue_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Drop completed items older than `keep`. Returns the number removed.
    pub fn prune_completed_items(&self, keep: Duration) -> Result<usize, DbError> {
        let cutoff =
            (Utc::now() - chrono::Duration::seconds(keep.as_secs() as i64)).to_rfc3339();
        let removed = self.conn_ref().execute(
            "DELETE FROM queue_items WHERE status = 'completed' AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Depth of visible work for backpressure checks.
    pub fn queue_depth(&self, queue: &str) -> Result<i64, DbError> {
        let depth = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM queue_items
             WHERE queue = ?1 AND status IN ('pending', 'processing')",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(depth)
    }
}

fn map_queue_row(row: &rusqlite::Row) -> rusqlite::Result<DbQueueItem> {
    Ok(DbQueueItem {
        id: row.get("id")?,
        queue: row.get("queue")?,
        user_id: row.get("user_id")?,
        payload: row.get("payload")?,
        priority: row.get("priority")?,
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        next_visible_at: row.get("next_visible_at")?,
        lease_expires_at: row.get("lease_expires_at")?,
        worker: row.get("worker")?,
        error: row.get("error")?,
        dedup_key: row.get("dedup_key")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    fn enqueue(store: &Metastore, payload: &str, priority: i32, dedup: Option<&str>) -> i64 {
        store
            .enqueue_item(QUEUE_NOTIFICATION, "u1", payload, priority, 3, dedup)
            .unwrap()
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let store = temp_store();
        enqueue(&store, "low", 7, None);
        enqueue(&store, "high", 2, None);
        enqueue(&store, "mid-a", 5, None);
        enqueue(&store, "mid-b", 5, None);

        let items = store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 10, Duration::from_secs(60))
            .unwrap();
        let payloads: Vec<&str> = items.iter().map(|i| i.payload.as_str()).collect();
        assert_eq!(payloads, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_reservation_is_exclusive() {
        let store = temp_store();
        enqueue(&store, "only", 5, None);

        let first = store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 10, Duration::from_secs(60))
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .reserve_items(QUEUE_NOTIFICATION, "w2", 10, Duration::from_secs(60))
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_dedup_raises_priority() {
        let store = temp_store();
        let id1 = enqueue(&store, "{}", 6, Some("u1:m1:c1"));
        let id2 = enqueue(&store, "{}", 3, Some("u1:m1:c1"));
        assert_eq!(id1, id2);

        let item = store.get_queue_item(id1).unwrap().unwrap();
        assert_eq!(item.priority, 3);

        // A weaker re-enqueue does not lower it back
        let id3 = enqueue(&store, "{}", 9, Some("u1:m1:c1"));
        assert_eq!(id1, id3);
        assert_eq!(store.get_queue_item(id1).unwrap().unwrap().priority, 3);
    }

    #[test]
    fn test_completed_item_allows_new_enqueue() {
        let store = temp_store();
        let id1 = enqueue(&store, "{}", 5, Some("u1:m1:c1"));
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();
        store.complete_item(id1).unwrap();

        let id2 = enqueue(&store, "{}", 5, Some("u1:m1:c1"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_retryable_failure_defers_visibility() {
        let store = temp_store();
        let id = enqueue(&store, "{}", 5, None);
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();
        store
            .fail_item(id, "timeout", true, Some(Duration::from_secs(300)))
            .unwrap();

        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.status, STATUS_PENDING);
        assert_eq!(item.attempts, 1);

        // Not visible yet
        let reserved = store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();
        assert!(reserved.is_empty());
    }

    #[test]
    fn test_exhausted_attempts_go_dead() {
        let store = temp_store();
        let id = enqueue(&store, "{}", 5, None);
        for _ in 0..3 {
            let reserved = store
                .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
                .unwrap();
            assert_eq!(reserved.len(), 1);
            store
                .fail_item(id, "boom", true, Some(Duration::from_secs(0)))
                .unwrap();
        }
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.status, STATUS_DEAD);

        // Dead items are invisible to workers
        let reserved = store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();
        assert!(reserved.is_empty());
        assert_eq!(store.list_dead_items(QUEUE_NOTIFICATION, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_permanent_failure_goes_straight_to_dead() {
        let store = temp_store();
        let id = enqueue(&store, "{}", 5, None);
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();
        store.fail_item(id, "bad schema", false, None).unwrap();
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.status, STATUS_DEAD);
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let store = temp_store();
        let id = enqueue(&store, "{}", 5, None);
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(0))
            .unwrap();

        // Lease of zero seconds lapses immediately; next reserve reclaims it.
        std::thread::sleep(Duration::from_millis(1100));
        let reclaimed = store
            .reserve_items(QUEUE_NOTIFICATION, "w2", 1, Duration::from_secs(60))
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, id);
    }

    #[test]
    fn test_release_user_leases_preserves_attempts() {
        let store = temp_store();
        let id = enqueue(&store, "{}", 5, None);
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();

        let released = store.release_user_leases("u1", QUEUE_NOTIFICATION).unwrap();
        assert_eq!(released, 1);
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.status, STATUS_PENDING);
        assert_eq!(item.attempts, 0, "release must not consume an attempt");
    }

    #[test]
    fn test_stats_and_depth() {
        let store = temp_store();
        enqueue(&store, "a", 5, None);
        enqueue(&store, "b", 5, None);
        store
            .reserve_items(QUEUE_NOTIFICATION, "w1", 1, Duration::from_secs(60))
            .unwrap();

        let stats = store.queue_stats(QUEUE_NOTIFICATION).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(store.queue_depth(QUEUE_NOTIFICATION).unwrap(), 2);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(20), 900);
    }
}
