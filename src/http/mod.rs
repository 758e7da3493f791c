//! HTTP API, versioned under `/api/v1`.
//!
//! Thin translation layer: handlers validate input, call into the core, and
//! map the error taxonomy onto status codes. All routes except the provider
//! webhook require bearer auth resolving to a stored user.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::CoreError;
use crate::state::AppState;

pub mod auth;
pub mod projects;
pub mod scan;
pub mod queue;
pub mod webhook;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AuthExpired => StatusCode::UNAUTHORIZED,
            CoreError::QuotaExceeded => StatusCode::FORBIDDEN,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ResolverConflict(_) => StatusCode::CONFLICT,
            CoreError::Db(crate::db::DbError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("API: internal error: {err}");
        }
        ApiError::new(status, err.to_string())
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/projects",
            get(projects::list_projects),
        )
        .route(
            "/projects/:id",
            get(projects::get_project).patch(projects::patch_project),
        )
        .route("/projects/:id/emails", post(projects::assign_email))
        .route(
            "/projects/:id/emails/:mid",
            axum::routing::delete(projects::unassign_email),
        )
        .route("/projects/:id/merge", post(projects::merge_project))
        .route("/projects/:id/split", post(projects::split_project))
        .route("/scan/ondemand", post(scan::ondemand))
        .route("/scan/retroactive", post(scan::retroactive))
        .route("/queue", get(queue::stats))
        .route("/queue/process", post(queue::process))
        .route("/webhook/mail", post(webhook::mail_webhook))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
}

async fn healthz() -> &'static str {
    "ok"
}
