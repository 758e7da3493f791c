use rusqlite::params;

use super::{now_rfc3339, DbError, Metastore};

/// User role for the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Admin,
    User,
    Viewer,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
            UserRole::Viewer => "viewer",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "admin" => UserRole::Admin,
            "viewer" => UserRole::Viewer,
            _ => UserRole::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbUser {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: UserRole,
    pub api_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<String>,
    pub auth_expired: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Metastore {
    /// Insert or update a user. Credentials are only overwritten when provided.
    pub fn upsert_user(&self, user: &DbUser) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "INSERT INTO users (
                id, email, display_name, role, api_token, access_token,
                refresh_token, token_expiry, auth_expired, is_active,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                role = excluded.role,
                api_token = COALESCE(excluded.api_token, users.api_token),
                access_token = COALESCE(excluded.access_token, users.access_token),
                refresh_token = COALESCE(excluded.refresh_token, users.refresh_token),
                token_expiry = COALESCE(excluded.token_expiry, users.token_expiry),
                auth_expired = excluded.auth_expired,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                user.id,
                user.email,
                user.display_name,
                user.role.as_str(),
                user.api_token,
                user.access_token,
                user.refresh_token,
                user.token_expiry,
                user.auth_expired as i32,
                user.is_active as i32,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<DbUser>, DbError> {
        self.query_user("SELECT * FROM users WHERE id = ?1", user_id)
    }

    pub fn get_user_by_api_token(&self, token: &str) -> Result<Option<DbUser>, DbError> {
        self.query_user(
            "SELECT * FROM users WHERE api_token = ?1 AND is_active = 1",
            token,
        )
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<DbUser>, DbError> {
        self.query_user("SELECT * FROM users WHERE email = ?1", email)
    }

    fn query_user(&self, sql: &str, arg: &str) -> Result<Option<DbUser>, DbError> {
        let mut stmt = self.conn_ref().prepare(sql)?;
        let mut rows = stmt.query_map(params![arg], map_user_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Users whose workers should run: active, credentials present, not expired.
    pub fn list_workable_users(&self) -> Result<Vec<DbUser>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM users
             WHERE is_active = 1 AND auth_expired = 0 AND access_token IS NOT NULL
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Rotate stored credentials after a token refresh.
    pub fn set_user_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        expiry: Option<&str>,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE users SET access_token = ?1, token_expiry = ?2,
                    auth_expired = 0, updated_at = ?3
             WHERE id = ?4",
            params![access_token, expiry, now, user_id],
        )?;
        Ok(())
    }

    /// Pause or resume a user's workers after an auth failure / re-consent.
    pub fn set_user_auth_expired(&self, user_id: &str, expired: bool) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE users SET auth_expired = ?1, updated_at = ?2 WHERE id = ?3",
            params![expired as i32, now, user_id],
        )?;
        Ok(())
    }

    /// Soft delete: deactivate the user; downstream records stay for audit.
    pub fn deactivate_user(&self, user_id: &str) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn_ref().execute(
            "UPDATE users SET is_active = 0, updated_at = ?1 WHERE id = ?2",
            params![now, user_id],
        )?;
        Ok(())
    }
}

fn map_user_row(row: &rusqlite::Row) -> rusqlite::Result<DbUser> {
    Ok(DbUser {
        id: row.get("id")?,
        email: row.get("email")?,
        display_name: row.get("display_name")?,
        role: UserRole::from_str_lossy(&row.get::<_, String>("role")?),
        api_token: row.get("api_token")?,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        token_expiry: row.get("token_expiry")?,
        auth_expired: row.get::<_, i32>("auth_expired")? != 0,
        is_active: row.get::<_, i32>("is_active")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
pub(crate) fn test_user(id: &str) -> DbUser {
    DbUser {
        id: id.to_string(),
        email: format!("{id}@example.test"),
        display_name: None,
        role: UserRole::User,
        api_token: Some(format!("token-{id}")),
        access_token: Some("ya29.test".into()),
        refresh_token: Some("1//refresh".into()),
        token_expiry: None,
        auth_expired: false,
        is_active: true,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;

    #[test]
    fn test_upsert_and_lookup() {
        let store = temp_store();
        store.upsert_user(&test_user("u1")).unwrap();

        let user = store.get_user("u1").unwrap().expect("user exists");
        assert_eq!(user.email, "u1@example.test");
        assert_eq!(user.role, UserRole::User);
        assert!(user.is_active);

        let by_token = store
            .get_user_by_api_token("token-u1")
            .unwrap()
            .expect("token lookup");
        assert_eq!(by_token.id, "u1");
    }

    #[test]
    fn test_upsert_preserves_tokens_when_absent() {
        let store = temp_store();
        store.upsert_user(&test_user("u1")).unwrap();

        let mut update = test_user("u1");
        update.access_token = None;
        update.refresh_token = None;
        update.display_name = Some("Renamed".into());
        store.upsert_user(&update).unwrap();

        let user = store.get_user("u1").unwrap().unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Renamed"));
        assert_eq!(user.access_token.as_deref(), Some("ya29.test"));
    }

    #[test]
    fn test_workable_users_excludes_expired_and_inactive() {
        let store = temp_store();
        store.upsert_user(&test_user("u1")).unwrap();
        store.upsert_user(&test_user("u2")).unwrap();
        store.upsert_user(&test_user("u3")).unwrap();

        store.set_user_auth_expired("u2", true).unwrap();
        store.deactivate_user("u3").unwrap();

        let workable = store.list_workable_users().unwrap();
        let ids: Vec<&str> = workable.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u1"]);
    }

    #[test]
    fn test_token_rotation_clears_auth_expired() {
        let store = temp_store();
        store.upsert_user(&test_user("u1")).unwrap();
        store.set_user_auth_expired("u1", true).unwrap();

        store
            .set_user_tokens("u1", "ya29.fresh", Some("2026-09-01T00:00:00Z"))
            .unwrap();
        let user = store.get_user("u1").unwrap().unwrap();
        assert!(!user.auth_expired);
        assert_eq!(user.access_token.as_deref(), Some("ya29.fresh"));
    }
}
