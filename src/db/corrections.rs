use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

/// Kind of user override. Append-only once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionKind {
    Assign,
    Unassign,
    Merge,
    Split,
    Rename,
}

impl CorrectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrectionKind::Assign => "assign",
            CorrectionKind::Unassign => "unassign",
            CorrectionKind::Merge => "merge",
            CorrectionKind::Split => "split",
            CorrectionKind::Rename => "rename",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "assign" => Some(CorrectionKind::Assign),
            "unassign" => Some(CorrectionKind::Unassign),
            "merge" => Some(CorrectionKind::Merge),
            "split" => Some(CorrectionKind::Split),
            "rename" => Some(CorrectionKind::Rename),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbCorrection {
    pub id: String,
    pub user_id: String,
    pub kind: CorrectionKind,
    /// Snapshot of the state the user overrode.
    pub original: serde_json::Value,
    /// Snapshot of the state the user asked for.
    pub corrected: serde_json::Value,
    pub email_id: Option<String>,
    pub project_id: Option<String>,
    pub reason: Option<String>,
    pub processed: bool,
    pub created_at: String,
}

/// Kind of learned rule derived from corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Alias,
    Sender,
    Address,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::Alias => "alias",
            PatternKind::Sender => "sender",
            PatternKind::Address => "address",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "sender" => PatternKind::Sender,
            "address" => PatternKind::Address,
            _ => PatternKind::Alias,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbPattern {
    pub id: i64,
    pub user_id: String,
    pub kind: PatternKind,
    /// Stable lookup key: hex SHA-256 of the canonical matched value
    /// (alias text, sender address, normalized street+postcode).
    pub pattern_key: String,
    /// Pattern body, e.g. `{"project_id": "...", "value": "smith res"}`.
    pub body: serde_json::Value,
    pub confidence: f64,
    pub usage_count: i64,
    pub is_active: bool,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl DbPattern {
    pub fn project_id(&self) -> Option<&str> {
        self.body.get("project_id").and_then(|v| v.as_str())
    }

    /// The raw canonical value the hashed key was derived from. Alias
    /// patterns match on this, since a digest cannot substring-match.
    pub fn matched_value(&self) -> Option<&str> {
        self.body.get("value").and_then(|v| v.as_str())
    }
}

impl Metastore {
    /// Append a correction. The log is append-only; rows are never mutated
    /// except for the `processed` flag set by the learning pass.
    pub fn insert_correction(&self, correction: &DbCorrection) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO corrections (
                id, user_id, kind, original, corrected, email_id, project_id,
                reason, processed, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                correction.id,
                correction.user_id,
                correction.kind.as_str(),
                correction.original.to_string(),
                correction.corrected.to_string(),
                correction.email_id,
                correction.project_id,
                correction.reason,
                now,
            ],
        )?;
        Ok(())
    }

    /// Corrections the learning pass has not consumed yet, oldest first.
    pub fn unprocessed_corrections(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<DbCorrection>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM corrections
             WHERE user_id = ?1 AND processed = 0
             ORDER BY created_at
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], map_correction_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn corrections_for_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Vec<DbCorrection>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM corrections
             WHERE user_id = ?1 AND project_id = ?2
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id, project_id], map_correction_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn mark_corrections_processed(&self, ids: &[String]) -> Result<usize, DbError> {
        let now = now_rfc3339();
        let mut updated = 0;
        for id in ids {
            updated += self.conn_ref().execute(
                "UPDATE corrections SET processed = 1, processed_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(updated)
    }

    /// Whether any correction still references this project. A referenced
    /// project may be archived but never hard-deleted.
    pub fn project_has_corrections(&self, user_id: &str, project_id: &str) -> Result<bool, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT 1 FROM corrections WHERE user_id = ?1 AND project_id = ?2 LIMIT 1",
        )?;
        Ok(stmt.exists(params![user_id, project_id])?)
    }

    // -----------------------------------------------------------------------
    // Learning patterns
    // -----------------------------------------------------------------------

    /// Upsert a pattern; repeat observations increment the usage counter and
    /// grow confidence along min(0.85, 0.5 + 0.05 * usage_count).
    pub fn upsert_pattern(
        &self,
        user_id: &str,
        kind: PatternKind,
        pattern_key: &str,
        body: &serde_json::Value,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO learning_patterns
                (user_id, kind, pattern_key, body, confidence, usage_count,
                 is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 0.55, 1, 1, ?5)
             ON CONFLICT (user_id, kind, pattern_key) DO UPDATE SET
                body = excluded.body,
                usage_count = usage_count + 1,
                confidence = MIN(0.85, 0.5 + 0.05 * (usage_count + 1)),
                is_active = 1",
            params![user_id, kind.as_str(), pattern_key, body.to_string(), now],
        )?;
        Ok(())
    }

    pub fn active_patterns(&self, user_id: &str) -> Result<Vec<DbPattern>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM learning_patterns
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY kind, pattern_key",
        )?;
        let rows = stmt.query_map(params![user_id], map_pattern_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Deactivate, never delete: the pattern's history stays auditable.
    pub fn deactivate_pattern(&self, user_id: &str, pattern_id: i64) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE learning_patterns SET is_active = 0
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, pattern_id],
        )?;
        Ok(())
    }

    pub fn touch_pattern_usage(&self, pattern_id: i64) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE learning_patterns SET last_used_at = ?1 WHERE id = ?2",
            params![now, pattern_id],
        )?;
        Ok(())
    }
}

fn map_correction_row(row: &rusqlite::Row) -> rusqlite::Result<DbCorrection> {
    let original_raw: String = row.get("original")?;
    let corrected_raw: String = row.get("corrected")?;
    Ok(DbCorrection {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        kind: CorrectionKind::parse(&row.get::<_, String>("kind")?)
            .unwrap_or(CorrectionKind::Assign),
        original: serde_json::from_str(&original_raw).unwrap_or(serde_json::Value::Null),
        corrected: serde_json::from_str(&corrected_raw).unwrap_or(serde_json::Value::Null),
        email_id: row.get("email_id")?,
        project_id: row.get("project_id")?,
        reason: row.get("reason")?,
        processed: row.get::<_, i32>("processed")? != 0,
        created_at: row.get("created_at")?,
    })
}

fn map_pattern_row(row: &rusqlite::Row) -> rusqlite::Result<DbPattern> {
    let body_raw: String = row.get("body")?;
    Ok(DbPattern {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        kind: PatternKind::from_str_lossy(&row.get::<_, String>("kind")?),
        pattern_key: row.get("pattern_key")?,
        body: serde_json::from_str(&body_raw).unwrap_or(serde_json::Value::Null),
        confidence: row.get("confidence")?,
        usage_count: row.get("usage_count")?,
        is_active: row.get::<_, i32>("is_active")? != 0,
        created_at: row.get("created_at")?,
        last_used_at: row.get("last_used_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use serde_json::json;

    fn correction(id: &str, kind: CorrectionKind) -> DbCorrection {
        DbCorrection {
            id: id.to_string(),
            user_id: "u1".into(),
            kind,
            original: json!({"project_id": "p1"}),
            corrected: json!({"project_id": "p2"}),
            email_id: Some("m1".into()),
            project_id: Some("p2".into()),
            reason: None,
            processed: false,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_append_and_consume() {
        let store = temp_store();
        store
            .insert_correction(&correction("c1", CorrectionKind::Assign))
            .unwrap();
        store
            .insert_correction(&correction("c2", CorrectionKind::Merge))
            .unwrap();

        let unprocessed = store.unprocessed_corrections("u1", 10).unwrap();
        assert_eq!(unprocessed.len(), 2);
        assert_eq!(unprocessed[0].kind, CorrectionKind::Assign);
        assert_eq!(unprocessed[0].original["project_id"], "p1");

        store
            .mark_corrections_processed(&["c1".to_string()])
            .unwrap();
        let remaining = store.unprocessed_corrections("u1", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "c2");
    }

    #[test]
    fn test_project_reference_check() {
        let store = temp_store();
        store
            .insert_correction(&correction("c1", CorrectionKind::Assign))
            .unwrap();
        assert!(store.project_has_corrections("u1", "p2").unwrap());
        assert!(!store.project_has_corrections("u1", "p9").unwrap());
    }

    #[test]
    fn test_pattern_confidence_ramp() {
        let store = temp_store();
        let body = json!({"project_id": "p1"});

        store
            .upsert_pattern("u1", PatternKind::Alias, "smith res", &body)
            .unwrap();
        let patterns = store.active_patterns("u1").unwrap();
        assert_eq!(patterns.len(), 1);
        assert!((patterns[0].confidence - 0.55).abs() < 0.01);
        assert_eq!(patterns[0].usage_count, 1);

        store
            .upsert_pattern("u1", PatternKind::Alias, "smith res", &body)
            .unwrap();
        store
            .upsert_pattern("u1", PatternKind::Alias, "smith res", &body)
            .unwrap();
        let patterns = store.active_patterns("u1").unwrap();
        assert_eq!(patterns[0].usage_count, 3);
        assert!((patterns[0].confidence - 0.65).abs() < 0.01);
        assert_eq!(patterns[0].project_id(), Some("p1"));
    }

    #[test]
    fn test_deactivated_pattern_is_hidden() {
        let store = temp_store();
        store
            .upsert_pattern("u1", PatternKind::Sender, "alice@b.test", &json!({"project_id": "p1"}))
            .unwrap();
        let id = store.active_patterns("u1").unwrap()[0].id;
        store.deactivate_pattern("u1", id).unwrap();
        assert!(store.active_patterns("u1").unwrap().is_empty());
    }
}
