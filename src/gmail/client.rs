//! Typed Gmail v1 operations.
//!
//! Every method draws from the rate limiter's read or write bucket first,
//! then sends with retry. A `401` mid-batch triggers one refresh + replay;
//! the second `401` surfaces as `AuthExpired` and the caller pauses that
//! user's workers.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{error_for_status, refresh_access_token, send_with_retry, CredSession, RetryPolicy};
use crate::error::{CoreError, CoreResult};
use crate::rate_limit::{CallKind, RateLimiter};

const BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail batchModify accepts up to 1000 ids per call.
const BATCH_MODIFY_LIMIT: usize = 1000;

/// How long a caller will wait on the limiter before giving up.
const LIMITER_DEADLINE: Duration = Duration::from_secs(30);

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub email_address: String,
    #[serde(default)]
    pub history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStub {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageStub>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub history_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub internal_date: String,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub label_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    #[serde(default)]
    pub history_id: String,
    /// Epoch millis as a string, provider-defined.
    #[serde(default)]
    pub expiration: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    history_id: Option<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageAdded {
    #[serde(default)]
    message: Option<HistoryMessageStub>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryMessageStub {
    #[serde(default)]
    id: String,
    #[serde(default)]
    thread_id: String,
}

/// One new message discovered in the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub id: String,
    pub thread_id: String,
    /// The history record that introduced the message.
    pub cursor: String,
}

/// Result of enumerating history since a cursor.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<HistoryMessage>,
    /// Cursor to persist once the messages are enqueued.
    pub latest_cursor: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

pub struct GmailClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl GmailClient {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        GmailClient {
            http: reqwest::Client::new(),
            limiter,
            policy: RetryPolicy::default(),
        }
    }

    /// Gate on the limiter, refresh a stale token, then send. On `401` the
    /// request is replayed once after a refresh.
    async fn send_authorized<F>(
        &self,
        creds: &mut CredSession,
        kind: CallKind,
        make: F,
    ) -> CoreResult<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        self.limiter
            .acquire_within(&creds.user_id, kind, LIMITER_DEADLINE)
            .await
            .map_err(|wait| CoreError::RateLimited { retry_after: wait })?;

        if creds.is_expired() {
            refresh_access_token(&self.http, creds).await?;
        }

        let resp = send_with_retry(make(&self.http, &creds.access_token), &self.policy).await?;
        if resp.status().as_u16() != 401 {
            return Ok(resp);
        }

        refresh_access_token(&self.http, creds).await?;
        let resp = send_with_retry(make(&self.http, &creds.access_token), &self.policy).await?;
        if resp.status().as_u16() == 401 {
            return Err(CoreError::AuthExpired);
        }
        Ok(resp)
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> CoreResult<T> {
        if !resp.status().is_success() {
            return Err(error_for_status(resp).await);
        }
        resp.json().await.map_err(CoreError::from)
    }

    pub async fn profile(&self, creds: &mut CredSession) -> CoreResult<Profile> {
        let resp = self
            .send_authorized(creds, CallKind::Read, |http, token| {
                http.get(format!("{BASE}/profile")).bearer_auth(token)
            })
            .await?;
        Self::expect_json(resp).await
    }

    pub async fn list_messages(
        &self,
        creds: &mut CredSession,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> CoreResult<MessageList> {
        let query = query.to_string();
        let page_token = page_token.map(str::to_string);
        let resp = self
            .send_authorized(creds, CallKind::Read, move |http, token| {
                let mut params: Vec<(&str, String)> = vec![
                    ("q", query.clone()),
                    ("maxResults", max_results.to_string()),
                ];
                if let Some(ref pt) = page_token {
                    params.push(("pageToken", pt.clone()));
                }
                http.get(format!("{BASE}/messages"))
                    .bearer_auth(token)
                    .query(&params)
            })
            .await?;
        Self::expect_json(resp).await
    }

    /// Fetch a message. `include_body` requests the full MIME tree;
    /// otherwise only headers relevant to the pipeline come back.
    pub async fn fetch_message(
        &self,
        creds: &mut CredSession,
        message_id: &str,
        include_body: bool,
    ) -> CoreResult<MessageDetail> {
        let url = format!("{BASE}/messages/{message_id}");
        let resp = self
            .send_authorized(creds, CallKind::Read, move |http, token| {
                let req = http.get(&url).bearer_auth(token);
                if include_body {
                    req.query(&[("format", "full")])
                } else {
                    req.query(&[
                        ("format", "metadata"),
                        ("metadataHeaders", "From"),
                        ("metadataHeaders", "To"),
                        ("metadataHeaders", "Cc"),
                        ("metadataHeaders", "Subject"),
                        ("metadataHeaders", "Date"),
                        ("metadataHeaders", "List-Unsubscribe"),
                        ("metadataHeaders", "Precedence"),
                    ])
                }
            })
            .await?;
        Self::expect_json(resp).await
    }

    pub async fn list_labels(&self, creds: &mut CredSession) -> CoreResult<Vec<Label>> {
        let resp = self
            .send_authorized(creds, CallKind::Read, |http, token| {
                http.get(format!("{BASE}/labels")).bearer_auth(token)
            })
            .await?;
        let list: LabelList = Self::expect_json(resp).await?;
        Ok(list.labels)
    }

    pub async fn create_label(&self, creds: &mut CredSession, name: &str) -> CoreResult<Label> {
        let body = serde_json::json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let resp = self
            .send_authorized(creds, CallKind::Write, move |http, token| {
                http.post(format!("{BASE}/labels"))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;
        Self::expect_json(resp).await
    }

    pub async fn modify_message(
        &self,
        creds: &mut CredSession,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> CoreResult<()> {
        let url = format!("{BASE}/messages/{message_id}/modify");
        let body = serde_json::json!({
            "addLabelIds": add,
            "removeLabelIds": remove,
        });
        let resp = self
            .send_authorized(creds, CallKind::Write, move |http, token| {
                http.post(&url).bearer_auth(token).json(&body)
            })
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_status(resp).await);
        }
        Ok(())
    }

    /// Batch label changes, chunked to the provider's limit.
    pub async fn batch_modify(
        &self,
        creds: &mut CredSession,
        message_ids: &[String],
        add: &[String],
        remove: &[String],
    ) -> CoreResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        for chunk in message_ids.chunks(BATCH_MODIFY_LIMIT) {
            let body = serde_json::json!({
                "ids": chunk,
                "addLabelIds": add,
                "removeLabelIds": remove,
            });
            let resp = self
                .send_authorized(creds, CallKind::Write, move |http, token| {
                    http.post(format!("{BASE}/messages/batchModify"))
                        .bearer_auth(token)
                        .json(&body)
                })
                .await?;
            if !resp.status().is_success() {
                return Err(error_for_status(resp).await);
            }
        }
        Ok(message_ids.len())
    }

    pub async fn start_watch(
        &self,
        creds: &mut CredSession,
        topic: &str,
        label_ids: &[String],
    ) -> CoreResult<WatchResponse> {
        let body = serde_json::json!({
            "topicName": topic,
            "labelIds": label_ids,
            "labelFilterAction": "include",
        });
        let resp = self
            .send_authorized(creds, CallKind::Write, move |http, token| {
                http.post(format!("{BASE}/watch"))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;
        Self::expect_json(resp).await
    }

    pub async fn stop_watch(&self, creds: &mut CredSession) -> CoreResult<()> {
        let resp = self
            .send_authorized(creds, CallKind::Write, |http, token| {
                http.post(format!("{BASE}/stop")).bearer_auth(token)
            })
            .await?;
        // A missing watch is fine; stopping is idempotent.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(error_for_status(resp).await);
        }
        Ok(())
    }

    /// Enumerate messages added since `start_cursor`, following pages.
    pub async fn get_history(
        &self,
        creds: &mut CredSession,
        start_cursor: &str,
        max_pages: usize,
    ) -> CoreResult<HistoryPage> {
        let mut page = HistoryPage::default();
        let mut page_token: Option<String> = None;

        for _ in 0..max_pages.max(1) {
            let cursor = start_cursor.to_string();
            let token_param = page_token.clone();
            let resp = self
                .send_authorized(creds, CallKind::Read, move |http, token| {
                    let mut params: Vec<(&str, String)> = vec![
                        ("startHistoryId", cursor.clone()),
                        ("historyTypes", "messageAdded".to_string()),
                        ("maxResults", "100".to_string()),
                    ];
                    if let Some(ref pt) = token_param {
                        params.push(("pageToken", pt.clone()));
                    }
                    http.get(format!("{BASE}/history"))
                        .bearer_auth(token)
                        .query(&params)
                })
                .await?;

            // A 404 here means the cursor is too old; the caller rebaselines
            // from the profile's current history id.
            if resp.status().as_u16() == 404 {
                return Err(CoreError::NotFound("history cursor expired".into()));
            }
            let body: HistoryResponse = Self::expect_json(resp).await?;

            for record in &body.history {
                for added in &record.messages_added {
                    if let Some(stub) = &added.message {
                        if stub.id.is_empty() {
                            continue;
                        }
                        page.messages.push(HistoryMessage {
                            id: stub.id.clone(),
                            thread_id: stub.thread_id.clone(),
                            cursor: record.id.clone(),
                        });
                    }
                }
            }
            if let Some(hid) = body.history_id {
                page.latest_cursor = Some(hid);
            }

            match body.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_list_deserialization() {
        let json = r#"{
            "messages": [
                {"id": "msg1", "threadId": "thread1"},
                {"id": "msg2", "threadId": "thread2"}
            ],
            "nextPageToken": "token123"
        }"#;
        let list: MessageList = serde_json::from_str(json).unwrap();
        assert_eq!(list.messages.len(), 2);
        assert_eq!(list.messages[0].thread_id, "thread1");
        assert_eq!(list.next_page_token.as_deref(), Some("token123"));
    }

    #[test]
    fn test_message_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let list: MessageList = serde_json::from_str(json).unwrap();
        assert!(list.messages.is_empty());
    }

    #[test]
    fn test_message_detail_with_parts() {
        let json = r#"{
            "id": "m1",
            "threadId": "t1",
            "snippet": "Quote attached",
            "historyId": "8181",
            "labelIds": ["INBOX", "UNREAD"],
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "Alice <alice@builder.test>"},
                    {"name": "Subject", "value": "Quote for 12 Baker St"}
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": "SGVsbG8"}},
                    {
                        "mimeType": "application/pdf",
                        "filename": "quote.pdf",
                        "body": {"attachmentId": "att-1", "size": 2048}
                    }
                ]
            }
        }"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.history_id, "8181");
        assert_eq!(detail.label_ids, vec!["INBOX", "UNREAD"]);
        let payload = detail.payload.unwrap();
        assert_eq!(payload.parts.len(), 2);
        assert_eq!(payload.parts[1].filename, "quote.pdf");
        assert_eq!(
            payload.parts[1].body.as_ref().unwrap().attachment_id.as_deref(),
            Some("att-1")
        );
    }

    #[test]
    fn test_history_response_deserialization() {
        let json = r#"{
            "history": [
                {
                    "id": "9001",
                    "messagesAdded": [
                        {"message": {"id": "m1", "threadId": "t1", "labelIds": ["INBOX"]}}
                    ]
                },
                {"id": "9002", "labelsAdded": [{"message": {"id": "m1"}}]}
            ],
            "historyId": "9002"
        }"#;
        let resp: HistoryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.history.len(), 2);
        assert_eq!(resp.history[0].messages_added.len(), 1);
        assert!(resp.history[1].messages_added.is_empty());
        assert_eq!(resp.history_id.as_deref(), Some("9002"));
    }

    #[test]
    fn test_label_deserialization() {
        let json = r#"{"id": "Label_7", "name": "Project: Baker St", "type": "user"}"#;
        let label: Label = serde_json::from_str(json).unwrap();
        assert_eq!(label.id, "Label_7");
        assert_eq!(label.label_type, "user");
    }

    #[test]
    fn test_watch_response_deserialization() {
        let json = r#"{"historyId": "1234", "expiration": "1754726400000"}"#;
        let watch: WatchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(watch.history_id, "1234");
        assert_eq!(watch.expiration, "1754726400000");
    }
}
