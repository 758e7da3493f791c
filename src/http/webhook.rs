//! Provider push webhook.
//!
//! The Pub/Sub envelope is consumed opaquely: decode just enough to learn
//! which mailbox changed, then enqueue a single event. History is re-read
//! by the queue consumer, never trusted from the payload.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Deserialize)]
pub struct PushMessage {
    /// Base64 of `{"emailAddress": "...", "historyId": ...}`.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
}

#[derive(Deserialize)]
struct PushData {
    #[serde(rename = "emailAddress")]
    email_address: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub accepted: bool,
}

pub async fn mail_webhook(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<PushEnvelope>,
) -> ApiResult<(StatusCode, Json<WebhookResponse>)> {
    let data = envelope
        .message
        .and_then(|m| m.data)
        .ok_or_else(|| ApiError::bad_request("missing message data"))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&data)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&data))
        .map_err(|_| ApiError::bad_request("message data is not base64"))?;
    let push: PushData = serde_json::from_slice(&decoded)
        .map_err(|_| ApiError::bad_request("message data is not a push payload"))?;

    let user = {
        let store = state.store.lock().map_err(|_| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        })?;
        store
            .get_user_by_email(&push.email_address)
            .map_err(|e| ApiError::from(crate::error::CoreError::Db(e)))?
    };

    let user = match user {
        Some(u) if u.is_active => u,
        // Unknown mailbox: acknowledge so the provider stops redelivering,
        // but do nothing.
        _ => {
            log::debug!("Webhook: ignoring push for unknown mailbox");
            return Ok((StatusCode::OK, Json(WebhookResponse { accepted: false })));
        }
    };

    state.watch.handle_push(&user.id).map_err(ApiError::from)?;
    Ok((StatusCode::OK, Json(WebhookResponse { accepted: true })))
}
