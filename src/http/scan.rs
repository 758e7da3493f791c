//! Scan routes: on-demand processing and retroactive range scans.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::AuthenticatedUser;
use super::{ApiError, ApiResult};
use crate::db::{PRIORITY_RETRO, PRIORITY_DEFAULT};
use crate::queue::{
    enqueue_message_event, enqueue_processing_task, EventSource, MessageEvent, ProcessingTask,
};
use crate::state::AppState;
use crate::watch::creds_from_user;

const ONDEMAND_DEFAULT_LIMIT: u32 = 25;
const ONDEMAND_MAX_LIMIT: u32 = 200;

#[derive(Deserialize)]
pub struct OndemandQuery {
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct ScanResponse {
    pub enqueued: usize,
}

/// Enqueue up to N recent messages for immediate processing.
pub async fn ondemand(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<OndemandQuery>,
) -> ApiResult<Json<ScanResponse>> {
    user.require_write()?;
    let limit = query
        .limit
        .unwrap_or(ONDEMAND_DEFAULT_LIMIT)
        .min(ONDEMAND_MAX_LIMIT);

    let mut creds = creds_from_user(&user.0, &state.config).map_err(ApiError::from)?;
    let list = state
        .gmail
        .list_messages(&mut creds, "in:inbox", None, limit)
        .await
        .map_err(ApiError::from)?;

    let enqueued = {
        let store = state.store.lock().map_err(|_| {
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "store unavailable",
            )
        })?;
        if creds.refreshed {
            store
                .set_user_tokens(&creds.user_id, &creds.access_token, creds.expiry.as_deref())
                .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?;
        }
        let mut enqueued = 0;
        for stub in &list.messages {
            enqueue_message_event(
                &store,
                &MessageEvent {
                    user_id: user.id().to_string(),
                    message_id: Some(stub.id.clone()),
                    thread_id: Some(stub.thread_id.clone()).filter(|t| !t.is_empty()),
                    history_cursor: None,
                    source: EventSource::OnDemand,
                },
                PRIORITY_DEFAULT - 2,
                state.config.queue_max_attempts,
            )
            .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?;
            enqueued += 1;
        }
        enqueued
    };

    Ok(Json(ScanResponse { enqueued }))
}

#[derive(Deserialize)]
pub struct RetroactiveBody {
    /// Inclusive range bounds, `YYYY-MM-DD`.
    pub start: String,
    pub end: String,
}

/// Enqueue a retroactive scan over a date range. The range is admitted as
/// slices through the AI queue at background priority, so live mail always
/// wins; each slice pages itself forward.
pub async fn retroactive(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(body): Json<RetroactiveBody>,
) -> ApiResult<Json<ScanResponse>> {
    user.require_write()?;
    let start = parse_date(&body.start)
        .ok_or_else(|| ApiError::bad_request("start must be YYYY-MM-DD"))?;
    let end =
        parse_date(&body.end).ok_or_else(|| ApiError::bad_request("end must be YYYY-MM-DD"))?;
    if start > end {
        return Err(ApiError::bad_request("start must not be after end"));
    }

    let store = state.store.lock().map_err(|_| {
        ApiError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "store unavailable",
        )
    })?;
    enqueue_processing_task(
        &store,
        &ProcessingTask::RetroactiveScanSlice {
            user_id: user.id().to_string(),
            after: start.format("%Y/%m/%d").to_string(),
            // Provider "before:" is exclusive; include the end day.
            before: (end + chrono::Duration::days(1)).format("%Y/%m/%d").to_string(),
            page_token: None,
        },
        PRIORITY_RETRO,
        state.config.queue_max_attempts,
    )
    .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?;

    Ok(Json(ScanResponse { enqueued: 1 }))
}

fn parse_date(raw: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}
