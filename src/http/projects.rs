//! Project routes: listing, detail, manual corrections.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::AuthenticatedUser;
use super::{ApiError, ApiResult};
use crate::corrections::{
    apply_assign, apply_merge, apply_rename, apply_split, apply_unassign,
};
use crate::db::{DbProject, ProjectStatus};
use crate::state::AppState;

#[derive(Serialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub email_count: i64,
    pub last_email_at: Option<String>,
    pub needs_review: bool,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub summary: ProjectSummary,
    pub aliases: Vec<String>,
    pub address: crate::db::ProjectAddress,
    pub client: crate::db::ProjectClient,
    pub project_type: Option<String>,
    pub job_numbers: Vec<String>,
    pub confidence: f64,
    pub created_at: String,
}

fn summary_of(project: &DbProject) -> ProjectSummary {
    ProjectSummary {
        id: project.id.clone(),
        name: project.name.clone(),
        status: project.status.as_str().to_string(),
        email_count: project.email_count,
        last_email_at: project.last_email_at.clone(),
        needs_review: project.needs_review,
    }
}

fn detail_of(project: &DbProject) -> ProjectDetail {
    ProjectDetail {
        summary: summary_of(project),
        aliases: project.aliases.clone(),
        address: project.address.clone(),
        client: project.client.clone(),
        project_type: project.project_type.clone(),
        job_numbers: project.job_numbers.clone(),
        confidence: project.confidence,
        created_at: project.created_at.clone(),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ProjectSummary>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ProjectStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let store = lock(&state)?;
    let projects = store
        .list_projects(user.id(), status)
        .map_err(core_err)?;
    Ok(Json(projects.iter().map(summary_of).collect()))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    let store = lock(&state)?;
    let project = store
        .get_project(user.id(), &project_id)
        .map_err(core_err)?
        .ok_or_else(|| ApiError::not_found(format!("project {project_id}")))?;
    Ok(Json(detail_of(&project)))
}

#[derive(Deserialize)]
pub struct PatchProjectBody {
    pub name: Option<String>,
    #[serde(default)]
    pub add_aliases: Vec<String>,
    pub status: Option<String>,
    pub reason: Option<String>,
}

pub async fn patch_project(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<PatchProjectBody>,
) -> ApiResult<Json<ProjectDetail>> {
    user.require_write()?;
    let status = match body.status.as_deref() {
        Some(raw) => Some(
            ProjectStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };

    let store = lock(&state)?;
    apply_rename(
        &store,
        user.id(),
        &project_id,
        body.name.as_deref(),
        &body.add_aliases,
        status,
        body.reason.as_deref(),
    )
    .map_err(ApiError::from)?;

    let project = store
        .get_project(user.id(), &project_id)
        .map_err(core_err)?
        .ok_or_else(|| ApiError::not_found(format!("project {project_id}")))?;
    Ok(Json(detail_of(&project)))
}

#[derive(Deserialize)]
pub struct AssignBody {
    pub message_id: String,
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct CorrectionResponse {
    pub correction_id: String,
    pub project_id: Option<String>,
    pub moved_mappings: usize,
}

pub async fn assign_email(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<AssignBody>,
) -> ApiResult<Json<CorrectionResponse>> {
    user.require_write()?;
    if body.message_id.trim().is_empty() {
        return Err(ApiError::bad_request("message_id is required"));
    }
    let store = lock(&state)?;
    let outcome = apply_assign(
        &store,
        state.config.queue_max_attempts,
        user.id(),
        &body.message_id,
        &project_id,
        body.reason.as_deref(),
    )
    .map_err(ApiError::from)?;
    Ok(Json(CorrectionResponse {
        correction_id: outcome.correction_id,
        project_id: outcome.project_id,
        moved_mappings: outcome.moved_mappings,
    }))
}

pub async fn unassign_email(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path((project_id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<CorrectionResponse>> {
    user.require_write()?;
    let store = lock(&state)?;

    // The route names a project; refuse if the mapping points elsewhere.
    let mapping = store
        .get_active_mapping(user.id(), &message_id)
        .map_err(core_err)?
        .ok_or_else(|| ApiError::not_found(format!("no mapping for {message_id}")))?;
    if mapping.project_id != project_id {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            format!("message {message_id} is mapped to {}", mapping.project_id),
        ));
    }

    let outcome = apply_unassign(
        &store,
        state.config.queue_max_attempts,
        user.id(),
        &message_id,
        None,
    )
    .map_err(ApiError::from)?;
    Ok(Json(CorrectionResponse {
        correction_id: outcome.correction_id,
        project_id: outcome.project_id,
        moved_mappings: outcome.moved_mappings,
    }))
}

#[derive(Deserialize)]
pub struct MergeQuery {
    pub target: String,
}

pub async fn merge_project(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(project_id): Path<String>,
    Query(query): Query<MergeQuery>,
) -> ApiResult<Json<CorrectionResponse>> {
    user.require_write()?;
    let store = lock(&state)?;
    let outcome = apply_merge(
        &store,
        state.config.queue_max_attempts,
        user.id(),
        &project_id,
        &query.target,
        None,
    )
    .map_err(ApiError::from)?;
    Ok(Json(CorrectionResponse {
        correction_id: outcome.correction_id,
        project_id: outcome.project_id,
        moved_mappings: outcome.moved_mappings,
    }))
}

#[derive(Deserialize)]
pub struct SplitBody {
    pub message_ids: Vec<String>,
    pub new_name: String,
    pub reason: Option<String>,
}

pub async fn split_project(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<SplitBody>,
) -> ApiResult<Json<CorrectionResponse>> {
    user.require_write()?;
    let store = lock(&state)?;
    let outcome = apply_split(
        &store,
        state.config.queue_max_attempts,
        user.id(),
        &project_id,
        &body.message_ids,
        &body.new_name,
        body.reason.as_deref(),
    )
    .map_err(ApiError::from)?;
    Ok(Json(CorrectionResponse {
        correction_id: outcome.correction_id,
        project_id: outcome.project_id,
        moved_mappings: outcome.moved_mappings,
    }))
}

fn lock(
    state: &Arc<AppState>,
) -> Result<std::sync::MutexGuard<'_, crate::db::Metastore>, ApiError> {
    state.store.lock().map_err(|_| {
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store unavailable",
        )
    })
}

fn core_err(e: crate::db::DbError) -> ApiError {
    ApiError::from(crate::error::CoreError::Db(e))
}
