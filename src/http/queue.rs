//! Operational queue endpoints: stats and a manual drain trigger.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::auth::AuthenticatedUser;
use super::{ApiError, ApiResult};
use crate::db::{QUEUE_AI, QUEUE_NOTIFICATION, QUEUE_REFLECT};
use crate::state::AppState;
use crate::workers::{drain_ai_queue, drain_notification_queue, drain_reflect_queue};

#[derive(Serialize)]
pub struct QueueStatsView {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
}

/// Dead items are never auto-replayed; this listing is the only way out.
#[derive(Serialize)]
pub struct DeadItemView {
    pub id: i64,
    pub queue: String,
    pub user_id: String,
    pub attempts: i32,
    pub error: Option<String>,
    pub payload: String,
}

#[derive(Serialize)]
pub struct AllQueueStats {
    pub notification: QueueStatsView,
    pub ai: QueueStatsView,
    pub reflect: QueueStatsView,
    pub dead_items: Vec<DeadItemView>,
}

const DEAD_ITEMS_SHOWN: usize = 20;

pub async fn stats(
    State(state): State<Arc<AppState>>,
    _user: AuthenticatedUser,
) -> ApiResult<Json<AllQueueStats>> {
    let store = state.store.lock().map_err(|_| {
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store unavailable",
        )
    })?;
    let view = |queue: &str| -> Result<QueueStatsView, ApiError> {
        let s = store
            .queue_stats(queue)
            .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?;
        Ok(QueueStatsView {
            pending: s.pending,
            processing: s.processing,
            completed: s.completed,
            dead: s.dead,
        })
    };

    let mut dead_items = Vec::new();
    for queue in [QUEUE_NOTIFICATION, QUEUE_AI, QUEUE_REFLECT] {
        let dead = store
            .list_dead_items(queue, DEAD_ITEMS_SHOWN)
            .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?;
        dead_items.extend(dead.into_iter().map(|item| DeadItemView {
            id: item.id,
            queue: item.queue,
            user_id: item.user_id,
            attempts: item.attempts,
            error: item.error,
            payload: item.payload,
        }));
    }

    Ok(Json(AllQueueStats {
        notification: view(QUEUE_NOTIFICATION)?,
        ai: view(QUEUE_AI)?,
        reflect: view(QUEUE_REFLECT)?,
        dead_items,
    }))
}

#[derive(Serialize)]
pub struct ProcessResponse {
    pub notification_completed: usize,
    pub ai_completed: usize,
    pub reflect_completed: usize,
}

/// Run one drain round across all queues. Useful for operators and tests;
/// the scheduler does the same continuously.
pub async fn process(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> ApiResult<Json<ProcessResponse>> {
    user.require_write()?;
    let worker = format!("http:{}", user.id());
    let notification_completed = drain_notification_queue(&state, &worker, 10)
        .await
        .map_err(ApiError::from)?;
    let ai_completed = drain_ai_queue(&state, &worker, 4).await.map_err(ApiError::from)?;
    let reflect_completed = drain_reflect_queue(&state, &worker, 10)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(ProcessResponse {
        notification_completed,
        ai_completed,
        reflect_completed,
    }))
}
