use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Active,
    Completed,
    OnHold,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ProjectStatus::Active),
            "completed" => Some(ProjectStatus::Completed),
            "on_hold" => Some(ProjectStatus::OnHold),
            "archived" => Some(ProjectStatus::Archived),
            _ => None,
        }
    }
}

/// Normalized property address attached to a project.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProjectAddress {
    pub full: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub postcode: Option<String>,
}

impl ProjectAddress {
    pub fn is_empty(&self) -> bool {
        self.full.is_none()
            && self.street.is_none()
            && self.locality.is_none()
            && self.region.is_none()
            && self.postcode.is_none()
    }
}

/// Primary client contact.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProjectClient {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DbProject {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Case-folded, de-duplicated alternative names.
    pub aliases: Vec<String>,
    pub address: ProjectAddress,
    pub client: ProjectClient,
    pub project_type: Option<String>,
    pub job_numbers: Vec<String>,
    pub status: ProjectStatus,
    pub email_count: i64,
    pub last_email_at: Option<String>,
    pub created_from_email_id: Option<String>,
    pub confidence: f64,
    pub needs_review: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Metastore {
    pub fn insert_project(&self, project: &DbProject) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO projects (
                id, user_id, name, aliases, address_full, street, locality,
                region, postcode, client_name, client_email, client_phone,
                client_company, project_type, job_numbers, status, email_count,
                last_email_at, created_from_email_id, confidence, needs_review,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?22)",
            params![
                project.id,
                project.user_id,
                project.name,
                serde_json::to_string(&project.aliases).unwrap_or_else(|_| "[]".into()),
                project.address.full,
                project.address.street,
                project.address.locality,
                project.address.region,
                project.address.postcode,
                project.client.name,
                project.client.email,
                project.client.phone,
                project.client.company,
                project.project_type,
                serde_json::to_string(&project.job_numbers).unwrap_or_else(|_| "[]".into()),
                project.status.as_str(),
                project.email_count,
                project.last_email_at,
                project.created_from_email_id,
                project.confidence,
                project.needs_review as i32,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_project(&self, user_id: &str, project_id: &str) -> Result<Option<DbProject>, DbError> {
        let mut stmt = self
            .conn_ref()
            .prepare("SELECT * FROM projects WHERE user_id = ?1 AND id = ?2")?;
        let mut rows = stmt.query_map(params![user_id, project_id], map_project_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_projects(
        &self,
        user_id: &str,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<DbProject>, DbError> {
        let rows = match status {
            Some(s) => {
                let mut stmt = self.conn_ref().prepare(
                    "SELECT * FROM projects WHERE user_id = ?1 AND status = ?2
                     ORDER BY last_email_at DESC NULLS LAST, name",
                )?;
                let rows = stmt.query_map(params![user_id, s.as_str()], map_project_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn_ref().prepare(
                    "SELECT * FROM projects WHERE user_id = ?1
                     ORDER BY last_email_at DESC NULLS LAST, name",
                )?;
                let rows = stmt.query_map(params![user_id], map_project_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// Projects the resolver considers for matching: everything not archived.
    pub fn list_matchable_projects(&self, user_id: &str) -> Result<Vec<DbProject>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM projects WHERE user_id = ?1 AND status != 'archived'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], map_project_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn set_project_status(
        &self,
        user_id: &str,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let changed = self.conn_ref().execute(
            "UPDATE projects SET status = ?1, updated_at = ?2
             WHERE user_id = ?3 AND id = ?4",
            params![status.as_str(), now, user_id, project_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("project {project_id}")));
        }
        Ok(())
    }

    pub fn rename_project(
        &self,
        user_id: &str,
        project_id: &str,
        new_name: &str,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        let changed = self.conn_ref().execute(
            "UPDATE projects SET name = ?1, updated_at = ?2
             WHERE user_id = ?3 AND id = ?4",
            params![new_name, now, user_id, project_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("project {project_id}")));
        }
        Ok(())
    }

    pub fn set_project_needs_review(
        &self,
        user_id: &str,
        project_id: &str,
        needs_review: bool,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE projects SET needs_review = ?1, updated_at = ?2
             WHERE user_id = ?3 AND id = ?4",
            params![needs_review as i32, now, user_id, project_id],
        )?;
        Ok(())
    }

    /// Append aliases, case-folded and de-duplicated against name and existing set.
    pub fn add_project_aliases(
        &self,
        user_id: &str,
        project_id: &str,
        new_aliases: &[String],
    ) -> Result<(), DbError> {
        let project = self
            .get_project(user_id, project_id)?
            .ok_or_else(|| DbError::NotFound(format!("project {project_id}")))?;
        let mut aliases = project.aliases;
        let name_folded = project.name.to_lowercase();
        for alias in new_aliases {
            let folded = alias.trim().to_lowercase();
            if folded.is_empty() || folded == name_folded {
                continue;
            }
            if !aliases.iter().any(|a| a.to_lowercase() == folded) {
                aliases.push(alias.trim().to_string());
            }
        }
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE projects SET aliases = ?1, updated_at = ?2
             WHERE user_id = ?3 AND id = ?4",
            params![
                serde_json::to_string(&aliases).unwrap_or_else(|_| "[]".into()),
                now,
                user_id,
                project_id
            ],
        )?;
        Ok(())
    }

    /// Union new job numbers into the project's set.
    pub fn add_project_job_numbers(
        &self,
        user_id: &str,
        project_id: &str,
        new_numbers: &[String],
    ) -> Result<(), DbError> {
        let project = self
            .get_project(user_id, project_id)?
            .ok_or_else(|| DbError::NotFound(format!("project {project_id}")))?;
        let mut numbers = project.job_numbers;
        for n in new_numbers {
            let trimmed = n.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !numbers.iter().any(|existing| existing.eq_ignore_ascii_case(trimmed)) {
                numbers.push(trimmed.to_string());
            }
        }
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE projects SET job_numbers = ?1, updated_at = ?2
             WHERE user_id = ?3 AND id = ?4",
            params![
                serde_json::to_string(&numbers).unwrap_or_else(|_| "[]".into()),
                now,
                user_id,
                project_id
            ],
        )?;
        Ok(())
    }

    /// Recompute `email_count` and `last_email_at` from active mappings.
    ///
    /// The counters are denormalized for list views; this is the single
    /// function allowed to write them.
    pub fn recount_project(&self, user_id: &str, project_id: &str) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE projects SET
                email_count = (
                    SELECT COUNT(*) FROM email_project_mappings
                    WHERE user_id = ?1 AND project_id = ?2 AND is_active = 1
                ),
                last_email_at = (
                    SELECT MAX(COALESCE(message_date, created_at))
                    FROM email_project_mappings
                    WHERE user_id = ?1 AND project_id = ?2 AND is_active = 1
                ),
                updated_at = ?3
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, project_id, now],
        )?;
        Ok(())
    }
}

fn parse_json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn map_project_row(row: &rusqlite::Row) -> rusqlite::Result<DbProject> {
    Ok(DbProject {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        aliases: parse_json_list(row.get::<_, String>("aliases")?),
        address: ProjectAddress {
            full: row.get("address_full")?,
            street: row.get("street")?,
            locality: row.get("locality")?,
            region: row.get("region")?,
            postcode: row.get("postcode")?,
        },
        client: ProjectClient {
            name: row.get("client_name")?,
            email: row.get("client_email")?,
            phone: row.get("client_phone")?,
            company: row.get("client_company")?,
        },
        project_type: row.get("project_type")?,
        job_numbers: parse_json_list(row.get::<_, String>("job_numbers")?),
        status: ProjectStatus::parse(&row.get::<_, String>("status")?)
            .unwrap_or(ProjectStatus::Active),
        email_count: row.get("email_count")?,
        last_email_at: row.get("last_email_at")?,
        created_from_email_id: row.get("created_from_email_id")?,
        confidence: row.get("confidence")?,
        needs_review: row.get::<_, i32>("needs_review")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
pub(crate) fn test_project(user_id: &str, id: &str, name: &str) -> DbProject {
    DbProject {
        id: id.to_string(),
        user_id: user_id.to_string(),
        name: name.to_string(),
        aliases: Vec::new(),
        address: ProjectAddress::default(),
        client: ProjectClient::default(),
        project_type: None,
        job_numbers: Vec::new(),
        status: ProjectStatus::Active,
        email_count: 0,
        last_email_at: None,
        created_from_email_id: None,
        confidence: 0.9,
        needs_review: false,
        created_at: String::new(),
        updated_at: String::new(),
    }
}
