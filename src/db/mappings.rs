use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

/// How a mapping came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationMethod {
    Auto,
    Ai,
    Similarity,
    Manual,
}

impl AssociationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AssociationMethod::Auto => "auto",
            AssociationMethod::Ai => "ai",
            AssociationMethod::Similarity => "similarity",
            AssociationMethod::Manual => "manual",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "ai" => AssociationMethod::Ai,
            "similarity" => AssociationMethod::Similarity,
            "manual" => AssociationMethod::Manual,
            _ => AssociationMethod::Auto,
        }
    }
}

/// The association record between a provider message and a project.
///
/// Carries a small audit projection of the message (subject, sender, snippet,
/// date). Bodies are never stored.
#[derive(Debug, Clone)]
pub struct DbMapping {
    pub id: i64,
    pub user_id: String,
    pub project_id: String,
    pub email_id: String,
    pub thread_id: Option<String>,
    pub confidence: f64,
    pub association_method: AssociationMethod,
    pub is_primary: bool,
    pub is_active: bool,
    pub needs_review: bool,
    pub split_from_thread: bool,
    pub reflection_pending: bool,
    pub subject: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub snippet: Option<String>,
    pub message_date: Option<String>,
    /// Extracted property address, kept for correction mining.
    pub street: Option<String>,
    pub postcode: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for a new mapping write. The id and timestamps are assigned on insert.
#[derive(Debug, Clone, Default)]
pub struct NewMapping {
    pub user_id: String,
    pub project_id: String,
    pub email_id: String,
    pub thread_id: Option<String>,
    pub confidence: f64,
    pub association_method: Option<AssociationMethod>,
    pub needs_review: bool,
    pub split_from_thread: bool,
    pub subject: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub snippet: Option<String>,
    pub message_date: Option<String>,
    pub street: Option<String>,
    pub postcode: Option<String>,
}

impl Metastore {
    /// Write a mapping, retiring any existing active mapping for the same
    /// message first. Idempotent: re-assigning to the same project refreshes
    /// the row in place instead of churning ids.
    pub fn assign_mapping(&self, mapping: &NewMapping) -> Result<i64, DbError> {
        let now = now_rfc3339();
        let method = mapping
            .association_method
            .unwrap_or(AssociationMethod::Auto)
            .as_str();

        if let Some(existing) = self.get_active_mapping(&mapping.user_id, &mapping.email_id)? {
            if existing.project_id == mapping.project_id {
                self.conn_ref().execute(
                    "UPDATE email_project_mappings SET
                        confidence = ?1, association_method = ?2, needs_review = ?3,
                        split_from_thread = ?4, reflection_pending = 0, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        mapping.confidence,
                        method,
                        mapping.needs_review as i32,
                        mapping.split_from_thread as i32,
                        now,
                        existing.id
                    ],
                )?;
                return Ok(existing.id);
            }
            self.conn_ref().execute(
                "UPDATE email_project_mappings SET is_active = 0, updated_at = ?1
                 WHERE id = ?2",
                params![now, existing.id],
            )?;
        }

        self.conn_ref().execute(
            "INSERT INTO email_project_mappings (
                user_id, project_id, email_id, thread_id, confidence,
                association_method, is_primary, is_active, needs_review,
                split_from_thread, reflection_pending, subject, sender_email,
                sender_name, snippet, message_date, street, postcode,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 1, ?7, ?8, 0, ?9, ?10, ?11,
                       ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                mapping.user_id,
                mapping.project_id,
                mapping.email_id,
                mapping.thread_id,
                mapping.confidence,
                method,
                mapping.needs_review as i32,
                mapping.split_from_thread as i32,
                mapping.subject,
                mapping.sender_email,
                mapping.sender_name,
                mapping.snippet,
                mapping.message_date,
                mapping.street,
                mapping.postcode,
                now,
            ],
        )?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    pub fn get_active_mapping(
        &self,
        user_id: &str,
        email_id: &str,
    ) -> Result<Option<DbMapping>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM email_project_mappings
             WHERE user_id = ?1 AND email_id = ?2 AND is_active = 1",
        )?;
        let mut rows = stmt.query_map(params![user_id, email_id], map_mapping_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Active mappings of a thread, oldest first.
    pub fn thread_mappings(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> Result<Vec<DbMapping>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM email_project_mappings
             WHERE user_id = ?1 AND thread_id = ?2 AND is_active = 1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id, thread_id], map_mapping_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Active mappings of a project, newest message first.
    pub fn project_mappings(
        &self,
        user_id: &str,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<DbMapping>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM email_project_mappings
             WHERE user_id = ?1 AND project_id = ?2 AND is_active = 1
             ORDER BY COALESCE(message_date, created_at) DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user_id, project_id, limit as i64], map_mapping_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Whether any active mapping of the project came from this sender.
    pub fn project_has_sender(
        &self,
        user_id: &str,
        project_id: &str,
        sender_email: &str,
    ) -> Result<bool, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT 1 FROM email_project_mappings
             WHERE user_id = ?1 AND project_id = ?2 AND is_active = 1
               AND LOWER(sender_email) = LOWER(?3)
             LIMIT 1",
        )?;
        Ok(stmt.exists(params![user_id, project_id, sender_email])?)
    }

    pub fn deactivate_mapping(&self, user_id: &str, email_id: &str) -> Result<bool, DbError> {
        let now = now_rfc3339();
        let changed = self.conn_ref().execute(
            "UPDATE email_project_mappings SET is_active = 0, updated_at = ?1
             WHERE user_id = ?2 AND email_id = ?3 AND is_active = 1",
            params![now, user_id, email_id],
        )?;
        Ok(changed > 0)
    }

    /// Move every active mapping from one project to another (merge).
    pub fn repoint_project_mappings(
        &self,
        user_id: &str,
        from_project: &str,
        to_project: &str,
    ) -> Result<usize, DbError> {
        let now = now_rfc3339();
        let changed = self.conn_ref().execute(
            "UPDATE email_project_mappings
             SET project_id = ?1, reflection_pending = 1, updated_at = ?2
             WHERE user_id = ?3 AND project_id = ?4 AND is_active = 1",
            params![to_project, now, user_id, from_project],
        )?;
        Ok(changed)
    }

    /// Move specific messages to another project (split).
    pub fn repoint_mappings_by_email(
        &self,
        user_id: &str,
        email_ids: &[String],
        to_project: &str,
    ) -> Result<usize, DbError> {
        let now = now_rfc3339();
        let mut moved = 0;
        for email_id in email_ids {
            moved += self.conn_ref().execute(
                "UPDATE email_project_mappings
                 SET project_id = ?1, reflection_pending = 1, updated_at = ?2
                 WHERE user_id = ?3 AND email_id = ?4 AND is_active = 1",
                params![to_project, now, user_id, email_id],
            )?;
        }
        Ok(moved)
    }

    pub fn set_reflection_pending(&self, mapping_id: i64, pending: bool) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE email_project_mappings SET reflection_pending = ?1, updated_at = ?2
             WHERE id = ?3",
            params![pending as i32, now, mapping_id],
        )?;
        Ok(())
    }

    /// Mappings whose label reflection failed and awaits reconciliation.
    pub fn list_reflection_pending(&self, user_id: &str) -> Result<Vec<DbMapping>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM email_project_mappings
             WHERE user_id = ?1 AND is_active = 1 AND reflection_pending = 1
             ORDER BY updated_at",
        )?;
        let rows = stmt.query_map(params![user_id], map_mapping_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn map_mapping_row(row: &rusqlite::Row) -> rusqlite::Result<DbMapping> {
    Ok(DbMapping {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        project_id: row.get("project_id")?,
        email_id: row.get("email_id")?,
        thread_id: row.get("thread_id")?,
        confidence: row.get("confidence")?,
        association_method: AssociationMethod::from_str_lossy(
            &row.get::<_, String>("association_method")?,
        ),
        is_primary: row.get::<_, i32>("is_primary")? != 0,
        is_active: row.get::<_, i32>("is_active")? != 0,
        needs_review: row.get::<_, i32>("needs_review")? != 0,
        split_from_thread: row.get::<_, i32>("split_from_thread")? != 0,
        reflection_pending: row.get::<_, i32>("reflection_pending")? != 0,
        subject: row.get("subject")?,
        sender_email: row.get("sender_email")?,
        sender_name: row.get("sender_name")?,
        snippet: row.get("snippet")?,
        message_date: row.get("message_date")?,
        street: row.get("street")?,
        postcode: row.get("postcode")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
pub(crate) fn test_mapping(user: &str, project: &str, email: &str) -> NewMapping {
    NewMapping {
        user_id: user.to_string(),
        project_id: project.to_string(),
        email_id: email.to_string(),
        thread_id: Some(format!("t-{email}")),
        confidence: 0.9,
        sender_email: Some("alice@builder.test".into()),
        subject: Some("Quote".into()),
        ..NewMapping::default()
    }
}
