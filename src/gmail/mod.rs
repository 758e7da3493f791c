//! Native Gmail API client.
//!
//! Direct HTTP via reqwest; no vendor SDK. Every call draws from the
//! per-user rate limiter before it leaves the process, transient failures
//! retry with exponential backoff and jitter, and a `401` triggers exactly
//! one token refresh before surfacing `AuthExpired`.
//!
//! Modules:
//! - client: typed Gmail v1 operations (messages, labels, watch, history)
//! - parser: MIME tree walk into the message projection the pipeline uses

pub mod client;
pub mod parser;

pub use client::GmailClient;
pub use parser::{Address, AttachmentPart, ParsedMessage};

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Access-token life remaining under which we refresh preemptively.
const REFRESH_MARGIN_SECS: i64 = 60;

/// One user's OAuth2 credential set, loaded from the metastore for the
/// duration of a batch. After a refresh the caller persists `access_token`
/// and `expiry` back to the users table.
#[derive(Debug, Clone)]
pub struct CredSession {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// RFC 3339; None means unknown and is treated as expired.
    pub expiry: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    /// Set when a refresh happened so the caller knows to persist.
    pub refreshed: bool,
}

impl CredSession {
    /// Whether the access token is expired or within the refresh margin.
    pub fn is_expired(&self) -> bool {
        match &self.expiry {
            None => true,
            Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(expiry) => {
                    let now = chrono::Utc::now();
                    expiry <= now + chrono::Duration::seconds(REFRESH_MARGIN_SECS)
                }
                Err(_) => true,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchange the refresh token for a new access token, updating the session
/// in place. A `400`/`401` from the token endpoint means the grant itself is
/// dead and only re-consent can recover.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    creds: &mut CredSession,
) -> CoreResult<()> {
    let refresh_token = creds
        .refresh_token
        .as_deref()
        .ok_or(CoreError::AuthExpired)?;

    let resp = http
        .post(TOKEN_URI)
        .form(&[
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        if status.as_u16() == 400 || status.as_u16() == 401 {
            return Err(CoreError::AuthExpired);
        }
        let body = resp.text().await.unwrap_or_default();
        return Err(CoreError::Provider {
            status: status.as_u16(),
            message: format!("token refresh failed: {body}"),
        });
    }

    let body: RefreshResponse = resp.json().await?;
    let expires_in = body.expires_in.unwrap_or(3600);
    let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64);

    creds.access_token = body.access_token;
    creds.expiry = Some(expiry.to_rfc3339());
    creds.refreshed = true;
    Ok(())
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter: base * 2^attempt + up to 250 ms.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(1 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..250);
        Duration::from_millis(base + jitter)
    }
}

/// Send a request, retrying 5xx and network failures per the policy.
///
/// `429` is never retried here: it maps to `RateLimited` so the queue layer
/// can defer the item's visibility by the reported delay instead of burning
/// attempts against a closed budget.
pub async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> CoreResult<reqwest::Response> {
    // Non-cloneable body (streaming): single shot, no retries.
    if builder.try_clone().is_none() {
        return builder.send().await.map_err(CoreError::from);
    }

    let mut last_err: Option<CoreError> = None;
    for attempt in 0..policy.max_attempts {
        let req = match builder.try_clone() {
            Some(b) => b,
            None => break,
        };

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() == 429 {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(Duration::from_secs(30));
                    return Err(CoreError::RateLimited { retry_after });
                }
                if status.is_server_error() && attempt + 1 < policy.max_attempts {
                    log::warn!(
                        "Gmail: {} on attempt {}/{}, backing off",
                        status,
                        attempt + 1,
                        policy.max_attempts
                    );
                    tokio::time::sleep(policy.delay(attempt)).await;
                    last_err = Some(CoreError::Provider {
                        status: status.as_u16(),
                        message: "server error".into(),
                    });
                    continue;
                }
                return Ok(resp);
            }
            Err(e) if attempt + 1 < policy.max_attempts => {
                log::warn!(
                    "Gmail: network error on attempt {}/{}: {}",
                    attempt + 1,
                    policy.max_attempts,
                    e
                );
                tokio::time::sleep(policy.delay(attempt)).await;
                last_err = Some(CoreError::Network(e.to_string()));
            }
            Err(e) => return Err(CoreError::from(e)),
        }
    }

    Err(last_err.unwrap_or_else(|| CoreError::Network("retries exhausted".into())))
}

/// Map an unexpected provider status to the error taxonomy.
pub(crate) async fn error_for_status(resp: reqwest::Response) -> CoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    if status == 401 {
        return CoreError::AuthExpired;
    }
    if status == 403 && body.to_lowercase().contains("quota") {
        return CoreError::QuotaExceeded;
    }
    CoreError::Provider {
        status,
        message: body,
    }
}
