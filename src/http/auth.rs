//! Bearer-token authentication.
//!
//! `Authorization: Bearer <token>` resolves against the users table. The
//! extracted user gates every data route; viewers are read-only.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;

use super::ApiError;
use crate::db::{DbUser, UserRole};
use crate::state::AppState;

pub struct AuthenticatedUser(pub DbUser);

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn can_write(&self) -> bool {
        !matches!(self.0.role, UserRole::Viewer)
    }

    /// Reject mutation attempts from viewer tokens.
    pub fn require_write(&self) -> Result<(), ApiError> {
        if self.can_write() {
            Ok(())
        } else {
            Err(ApiError::new(
                axum::http::StatusCode::FORBIDDEN,
                "viewer tokens cannot modify projects",
            ))
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(ApiError::unauthorized)?;

        let user = {
            let store = state
                .store
                .lock()
                .map_err(|_| ApiError::new(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "store unavailable",
                ))?;
            store
                .get_user_by_api_token(token)
                .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?
        };

        user.map(AuthenticatedUser)
            .ok_or_else(ApiError::unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::users::test_user;

    #[test]
    fn test_viewer_cannot_write() {
        let mut user = test_user("u1");
        user.role = UserRole::Viewer;
        let auth = AuthenticatedUser(user);
        assert!(!auth.can_write());
        assert!(auth.require_write().is_err());

        let auth = AuthenticatedUser(test_user("u2"));
        assert!(auth.require_write().is_ok());
    }
}
