use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

/// Delivery mode for a user's mailbox change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Push,
    Polling,
}

impl WatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchKind::Push => "push",
            WatchKind::Polling => "polling",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        if raw == "push" {
            WatchKind::Push
        } else {
            WatchKind::Polling
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbWatch {
    pub user_id: String,
    pub topic: Option<String>,
    /// Last acknowledged history cursor; the next read starts here.
    pub history_cursor: Option<String>,
    pub expiry: Option<String>,
    pub kind: WatchKind,
    pub is_active: bool,
    pub last_event_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Metastore {
    /// Create or replace a user's subscription. At most one row per user.
    pub fn upsert_watch(
        &self,
        user_id: &str,
        topic: Option<&str>,
        history_cursor: Option<&str>,
        expiry: Option<&str>,
        kind: WatchKind,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO watch_subscriptions (
                user_id, topic, history_cursor, expiry, kind, is_active,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                topic = excluded.topic,
                history_cursor = COALESCE(excluded.history_cursor, watch_subscriptions.history_cursor),
                expiry = excluded.expiry,
                kind = excluded.kind,
                is_active = 1,
                updated_at = excluded.updated_at",
            params![user_id, topic, history_cursor, expiry, kind.as_str(), now],
        )?;
        Ok(())
    }

    pub fn get_watch(&self, user_id: &str) -> Result<Option<DbWatch>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT * FROM watch_subscriptions WHERE user_id = ?1")?;
        let mut rows = stmt.query_map(params![user_id], map_watch_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Advance the acknowledged cursor after history has been enumerated.
    pub fn set_watch_cursor(&self, user_id: &str, cursor: &str) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE watch_subscriptions
             SET history_cursor = ?1, updated_at = ?2
             WHERE user_id = ?3",
            params![cursor, now, user_id],
        )?;
        Ok(())
    }

    /// Record that a change event arrived (used to skip redundant polls).
    pub fn touch_watch_event(&self, user_id: &str) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE watch_subscriptions
             SET last_event_at = ?1, updated_at = ?1
             WHERE user_id = ?2",
            params![now, user_id],
        )?;
        Ok(())
    }

    /// Push subscriptions whose expiry falls inside the renewal margin.
    pub fn watches_needing_renewal(&self, before: &str) -> Result<Vec<DbWatch>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM watch_subscriptions
             WHERE is_active = 1 AND kind = 'push' AND expiry IS NOT NULL AND expiry <= ?1",
        )?;
        let rows = stmt.query_map(params![before], map_watch_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Tear down on user deactivation.
    pub fn deactivate_watch(&self, user_id: &str) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE watch_subscriptions SET is_active = 0, updated_at = ?1
             WHERE user_id = ?2",
            params![now, user_id],
        )?;
        Ok(())
    }
}

fn map_watch_row(row: &rusqlite::Row) -> rusqlite::Result<DbWatch> {
    Ok(DbWatch {
        user_id: row.get("user_id")?,
        topic: row.get("topic")?,
        history_cursor: row.get("history_cursor")?,
        expiry: row.get("expiry")?,
        kind: WatchKind::from_str_lossy(&row.get::<_, String>("kind")?),
        is_active: row.get::<_, i32>("is_active")? != 0,
        last_event_at: row.get("last_event_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    #[test]
    fn test_one_subscription_per_user() {
        let store = temp_store();
        store
            .upsert_watch("u1", None, Some("1000"), None, WatchKind::Polling)
            .unwrap();
        store
            .upsert_watch(
                "u1",
                Some("projects/x/topics/mail"),
                None,
                Some("2026-08-09T00:00:00Z"),
                WatchKind::Push,
            )
            .unwrap();

        let watch = store.get_watch("u1").unwrap().unwrap();
        assert_eq!(watch.kind, WatchKind::Push);
        // Cursor survives the upgrade to push
        assert_eq!(watch.history_cursor.as_deref(), Some("1000"));

        let count: i64 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM watch_subscriptions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_cursor_advances() {
        let store = temp_store();
        store
            .upsert_watch("u1", None, Some("1000"), None, WatchKind::Polling)
            .unwrap();
        store.set_watch_cursor("u1", "1042").unwrap();
        assert_eq!(
            store.get_watch("u1").unwrap().unwrap().history_cursor.as_deref(),
            Some("1042")
        );
    }

    #[test]
    fn test_renewal_window() {
        let store = temp_store();
        store
            .upsert_watch(
                "u1",
                Some("t"),
                None,
                Some("2026-08-02T01:00:00Z"),
                WatchKind::Push,
            )
            .unwrap();
        store
            .upsert_watch(
                "u2",
                Some("t"),
                None,
                Some("2026-08-20T00:00:00Z"),
                WatchKind::Push,
            )
            .unwrap();
        store
            .upsert_watch("u3", None, None, None, WatchKind::Polling)
            .unwrap();

        let due = store
            .watches_needing_renewal("2026-08-03T00:00:00Z")
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].user_id, "u1");
    }
}
