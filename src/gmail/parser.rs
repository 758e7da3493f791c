//! MIME tree → the message projection the pipeline works with.
//!
//! Walks multipart trees depth-first, prefers `text/plain`, falls back to
//! `text/html` reduced to text, and collects attachment parts recursively.
//! A part that fails to decode degrades only itself; the message is still
//! emitted with best-effort content.

use base64::Engine;
use chrono::{DateTime, Utc};

use super::client::{Header, MessageDetail, MessagePart};

/// A parsed (display name, mailbox) pair.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Address {
    pub name: String,
    pub email: String,
}

/// Attachment descriptor; content stays with the provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachmentPart {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
}

/// The projection of a provider message the resolver and audit need.
/// The body is held only for the duration of one processing attempt.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub id: String,
    pub thread_id: String,
    pub history_id: String,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub date: Option<DateTime<Utc>>,
    pub snippet: String,
    pub body_text: Option<String>,
    pub label_ids: Vec<String>,
    pub attachments: Vec<AttachmentPart>,
    pub list_unsubscribe: Option<String>,
    pub precedence: Option<String>,
}

impl ParsedMessage {
    /// Body if present, else the snippet. This is what extraction prompts consume.
    pub fn content(&self) -> &str {
        self.body_text.as_deref().unwrap_or(&self.snippet)
    }
}

/// Parse a full-format Gmail message into the pipeline projection.
pub fn parse_message(detail: &MessageDetail) -> ParsedMessage {
    let headers: &[Header] = detail
        .payload
        .as_ref()
        .map(|p| p.headers.as_slice())
        .unwrap_or(&[]);

    let get_header = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .filter(|v| !v.is_empty())
    };

    let mut body_text = None;
    let mut attachments = Vec::new();
    if let Some(payload) = &detail.payload {
        body_text = extract_body_text(payload, "text/plain")
            .or_else(|| extract_body_text(payload, "text/html").map(|html| html_to_text(&html)));
        collect_attachments(payload, &mut attachments);
    }

    ParsedMessage {
        id: detail.id.clone(),
        thread_id: detail.thread_id.clone(),
        history_id: detail.history_id.clone(),
        subject: get_header("Subject").unwrap_or_default(),
        from: get_header("From")
            .map(|raw| parse_address_list(&raw).into_iter().next().unwrap_or_default())
            .unwrap_or_default(),
        to: get_header("To").map(|raw| parse_address_list(&raw)).unwrap_or_default(),
        cc: get_header("Cc").map(|raw| parse_address_list(&raw)).unwrap_or_default(),
        date: get_header("Date").and_then(|raw| parse_date(&raw)),
        snippet: detail.snippet.clone(),
        body_text,
        label_ids: detail.label_ids.clone(),
        attachments,
        list_unsubscribe: get_header("List-Unsubscribe"),
        precedence: get_header("Precedence"),
    }
}

/// Depth-first search for body data of the target MIME type.
fn extract_body_text(part: &MessagePart, target_mime: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(target_mime) {
        if let Some(body) = &part.body {
            if let Some(data) = &body.data {
                if let Some(text) = decode_url_safe_base64(data) {
                    return Some(text);
                }
            }
        }
    }
    for child in &part.parts {
        if let Some(text) = extract_body_text(child, target_mime) {
            return Some(text);
        }
    }
    None
}

/// Collect every part that carries an attachment id, recursively.
fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentPart>) {
    if let Some(body) = &part.body {
        if let Some(att_id) = &body.attachment_id {
            if !part.filename.is_empty() {
                out.push(AttachmentPart {
                    attachment_id: att_id.clone(),
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    size: body.size,
                });
            }
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

/// Decode URL-safe base64 without padding, as the Gmail API emits.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => None,
    }
}

/// Parse an RFC 2822 date header to UTC; tolerates a trailing "(TZ)" comment.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = match raw.find(" (") {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    DateTime::parse_from_rfc2822(trimmed.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an address header like `"Alice" <alice@co.test>, bob@co.test`.
pub fn parse_address_list(header: &str) -> Vec<Address> {
    let mut results = Vec::new();
    for part in split_addresses(header) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let (Some(lt), Some(gt)) = (trimmed.find('<'), trimmed.rfind('>')) {
            if lt < gt {
                let email = trimmed[lt + 1..gt].trim().to_string();
                let name = trimmed[..lt].trim().trim_matches('"').trim().to_string();
                if !email.is_empty() {
                    results.push(Address { name, email });
                }
                continue;
            }
        }
        if trimmed.contains('@') {
            results.push(Address {
                name: String::new(),
                email: trimmed.to_string(),
            });
        }
    }
    results
}

/// Split on commas that are not inside a quoted display name.
fn split_addresses(header: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in header.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Reduce HTML to readable text: drop script/style, strip tags, decode the
/// common entities, collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    let cleaned = remove_blocks(html);
    decode_entities(&collapse_whitespace(&strip_tags(&cleaned)))
}

/// Drop `<script>` and `<style>` blocks wholesale; their text is never prose.
fn remove_blocks(html: &str) -> String {
    let mut cleaned = String::with_capacity(html.len());
    let mut remaining = html;
    loop {
        let lower_rem = remaining.to_lowercase();
        let start = match (lower_rem.find("<script"), lower_rem.find("<style")) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match start {
            Some(idx) => {
                cleaned.push_str(&remaining[..idx]);
                let tag = if lower_rem[idx..].starts_with("<script") {
                    "</script>"
                } else {
                    "</style>"
                };
                match lower_rem[idx..].find(tag) {
                    Some(end) => remaining = &remaining[idx + end + tag.len()..],
                    None => break,
                }
            }
            None => {
                cleaned.push_str(remaining);
                break;
            }
        }
    }
    cleaned
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::client::MessageDetail;

    fn detail_from_json(json: &str) -> MessageDetail {
        serde_json::from_str(json).expect("fixture parses")
    }

    #[test]
    fn test_parse_full_message() {
        let detail = detail_from_json(
            r#"{
            "id": "m1",
            "threadId": "t1",
            "snippet": "Quote attached...",
            "historyId": "500",
            "labelIds": ["INBOX"],
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "Alice Builder <alice@builder.test>"},
                    {"name": "To", "value": "office@trades.test, \"Smith, Bob\" <bob@sub.test>"},
                    {"name": "Subject", "value": "Quote for 12 Baker St renovation"},
                    {"name": "Date", "value": "Sat, 1 Aug 2026 09:30:00 +1000"}
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": "Sm9iICMyMDI0LTA4Nw"}},
                    {
                        "mimeType": "application/pdf",
                        "filename": "JOB-2024-087_quote.pdf",
                        "body": {"attachmentId": "att-1", "size": 2048}
                    }
                ]
            }
        }"#,
        );

        let parsed = parse_message(&detail);
        assert_eq!(parsed.subject, "Quote for 12 Baker St renovation");
        assert_eq!(parsed.from.email, "alice@builder.test");
        assert_eq!(parsed.from.name, "Alice Builder");
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.to[1].name, "Smith, Bob");
        assert_eq!(parsed.body_text.as_deref(), Some("Job #2024-087"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "JOB-2024-087_quote.pdf");
        assert!(parsed.date.is_some());
    }

    #[test]
    fn test_html_fallback_when_no_plain_part() {
        // "<p>New kitchen at <b>12 Baker Street</b></p>" base64url-encoded
        let html = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode("<p>New kitchen at <b>12 Baker Street</b></p>");
        let detail = detail_from_json(&format!(
            r#"{{
            "id": "m2", "threadId": "t2", "snippet": "",
            "payload": {{
                "mimeType": "multipart/alternative",
                "headers": [],
                "parts": [
                    {{"mimeType": "text/html", "body": {{"data": "{html}"}}}}
                ]
            }}
        }}"#
        ));
        let parsed = parse_message(&detail);
        assert_eq!(
            parsed.body_text.as_deref(),
            Some("New kitchen at 12 Baker Street")
        );
    }

    #[test]
    fn test_malformed_part_degrades_only_itself() {
        let detail = detail_from_json(
            r#"{
            "id": "m3", "threadId": "t3", "snippet": "fallback snippet",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [{"name": "Subject", "value": "Update"}],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": "!!!not-base64!!!"}},
                    {
                        "mimeType": "image/png",
                        "filename": "site.png",
                        "body": {"attachmentId": "att-2", "size": 99}
                    }
                ]
            }
        }"#,
        );
        let parsed = parse_message(&detail);
        // The broken text part yields no body, but attachments still parse
        // and the message is emitted with best-effort content.
        assert!(parsed.body_text.is_none());
        assert_eq!(parsed.content(), "fallback snippet");
        assert_eq!(parsed.attachments.len(), 1);
    }

    #[test]
    fn test_nested_multipart_depth_first() {
        let inner = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("nested body");
        let detail = detail_from_json(&format!(
            r#"{{
            "id": "m4", "threadId": "t4", "snippet": "",
            "payload": {{
                "mimeType": "multipart/mixed",
                "headers": [],
                "parts": [
                    {{
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {{"mimeType": "text/plain", "body": {{"data": "{inner}"}}}}
                        ]
                    }}
                ]
            }}
        }}"#
        ));
        let parsed = parse_message(&detail);
        assert_eq!(parsed.body_text.as_deref(), Some("nested body"));
    }

    #[test]
    fn test_parse_address_list_variants() {
        let addrs = parse_address_list(
            r#""Doe, Jane" <jane@customer.test>, plain@x.test, Bob <bob@sub.test>"#,
        );
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0].name, "Doe, Jane");
        assert_eq!(addrs[0].email, "jane@customer.test");
        assert_eq!(addrs[1].email, "plain@x.test");
        assert_eq!(addrs[2].name, "Bob");
    }

    #[test]
    fn test_parse_date_with_tz_comment() {
        let date = parse_date("Sat, 1 Aug 2026 09:30:00 +1000 (AEST)").unwrap();
        assert_eq!(date.to_rfc3339(), "2026-07-31T23:30:00+00:00");
    }

    #[test]
    fn test_html_to_text_strips_style_and_entities() {
        let text = html_to_text(
            "<style>p { color: red; }</style><p>Deck &amp; pergola&nbsp;quote</p>",
        );
        assert_eq!(text, "Deck & pergola quote");
    }

    #[test]
    fn test_headers_fold_case_insensitively() {
        let detail = detail_from_json(
            r#"{
            "id": "m5", "threadId": "t5", "snippet": "",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "SUBJECT", "value": "Caps"},
                    {"name": "precedence", "value": "bulk"}
                ]
            }
        }"#,
        );
        let parsed = parse_message(&detail);
        assert_eq!(parsed.subject, "Caps");
        assert_eq!(parsed.precedence.as_deref(), Some("bulk"));
    }
}
