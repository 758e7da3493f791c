use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

#[derive(Debug, Clone)]
pub struct DbAttachment {
    pub id: i64,
    pub user_id: String,
    pub email_id: String,
    pub thread_id: Option<String>,
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub category: String,
    /// Project-indicator tokens parsed from the filename.
    pub indicators: serde_json::Value,
    /// Weak reference, re-resolved when the message is (re)assigned.
    pub project_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub user_id: String,
    pub email_id: String,
    pub thread_id: Option<String>,
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub category: String,
    pub indicators: serde_json::Value,
}

impl Metastore {
    /// Record an attachment descriptor. Idempotent per (email, attachment id).
    pub fn insert_attachment(&self, attachment: &NewAttachment) -> Result<(), DbError> {
        let exists: bool = {
            let mut stmt = self.conn_ref().prepare(
                "SELECT 1 FROM attachments
                 WHERE user_id = ?1 AND email_id = ?2 AND attachment_id = ?3
                 LIMIT 1",
            )?;
            stmt.exists(params![
                attachment.user_id,
                attachment.email_id,
                attachment.attachment_id
            ])?
        };
        if exists {
            return Ok(());
        }
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO attachments (
                user_id, email_id, thread_id, attachment_id, filename,
                mime_type, size, category, indicators, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                attachment.user_id,
                attachment.email_id,
                attachment.thread_id,
                attachment.attachment_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size,
                attachment.category,
                attachment.indicators.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn attachments_for_email(
        &self,
        user_id: &str,
        email_id: &str,
    ) -> Result<Vec<DbAttachment>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM attachments WHERE user_id = ?1 AND email_id = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id, email_id], map_attachment_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn attachments_for_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Vec<DbAttachment>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM attachments WHERE user_id = ?1 AND project_id = ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id, project_id], map_attachment_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Re-resolve the weak project reference when a message is (re)assigned.
    pub fn set_attachment_project(
        &self,
        user_id: &str,
        email_id: &str,
        project_id: Option<&str>,
    ) -> Result<usize, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE attachments SET project_id = ?1
             WHERE user_id = ?2 AND email_id = ?3",
            params![project_id, user_id, email_id],
        )?;
        Ok(changed)
    }
}

fn map_attachment_row(row: &rusqlite::Row) -> rusqlite::Result<DbAttachment> {
    let indicators_raw: String = row.get("indicators")?;
    Ok(DbAttachment {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        email_id: row.get("email_id")?,
        thread_id: row.get("thread_id")?,
        attachment_id: row.get("attachment_id")?,
        filename: row.get("filename")?,
        mime_type: row.get("mime_type")?,
        size: row.get("size")?,
        category: row.get("category")?,
        indicators: serde_json::from_str(&indicators_raw).unwrap_or(serde_json::Value::Null),
        project_id: row.get("project_id")?,
        created_at: row.get("created_at")?,
    })
}
