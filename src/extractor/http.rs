//! Hosted-model extractor over plain HTTP chat completions.
//!
//! One implementation covers both configured vendors; the differences are
//! the endpoint, auth header and response envelope. Model name, temperature
//! and timeout are configuration, not code paths.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    parse_entities_response, parse_similarity_response, prompts, EntityExtractor,
    ExtractedEntities, ExtractionInput, SimilarityVerdict,
};
use crate::config::AiProvider;
use crate::error::{CoreError, CoreResult};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u32 = 2500;

/// Parse failures get this many reformatting retries before dead-lettering.
const PARSE_RETRIES: u32 = 2;

pub struct ChatExtractor {
    provider: AiProvider,
    model: String,
    api_key: String,
    timeout_secs: u64,
    http: reqwest::Client,
}

impl ChatExtractor {
    pub fn new(provider: AiProvider, model: String, api_key: String, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        ChatExtractor {
            provider,
            model,
            api_key,
            timeout_secs: timeout_ms.div_ceil(1000),
            http,
        }
    }

    /// One model call, returning the raw text of the completion.
    async fn complete(&self, prompt: &str) -> CoreResult<String> {
        let resp = match self.provider {
            AiProvider::OpenAi => {
                let body = json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": prompts::SYSTEM_PROMPT},
                        {"role": "user", "content": prompt}
                    ],
                    "temperature": TEMPERATURE,
                    "max_tokens": MAX_TOKENS,
                    "response_format": {"type": "json_object"},
                });
                self.http
                    .post(OPENAI_URL)
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
            }
            AiProvider::Anthropic => {
                let body = json!({
                    "model": self.model,
                    "system": prompts::SYSTEM_PROMPT,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": TEMPERATURE,
                    "max_tokens": MAX_TOKENS,
                });
                self.http
                    .post(ANTHROPIC_URL)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
                    .send()
                    .await
            }
            AiProvider::Stub => {
                return Err(CoreError::FatalConfig(
                    "ChatExtractor constructed with the stub provider".into(),
                ))
            }
        };

        let resp = resp.map_err(|e| {
            if e.is_timeout() {
                CoreError::Timeout(self.timeout_secs)
            } else {
                CoreError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            return Err(CoreError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::Provider {
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: serde_json::Value = resp.json().await?;
        let content = match self.provider {
            AiProvider::OpenAi => envelope["choices"][0]["message"]["content"].as_str(),
            AiProvider::Anthropic => envelope["content"][0]["text"].as_str(),
            AiProvider::Stub => None,
        };
        content
            .map(str::to_string)
            .ok_or_else(|| CoreError::ExtractionParse("empty completion".into()))
    }

    /// Call with escalating strictness until the response parses.
    async fn call_with_reparse<T, P, B>(&self, build: B, parse: P) -> CoreResult<T>
    where
        P: Fn(&str) -> CoreResult<T>,
        B: Fn(u32) -> String,
    {
        let mut last_err = None;
        for attempt in 0..=PARSE_RETRIES {
            let raw = self.complete(&build(attempt)).await?;
            match parse(&raw) {
                Ok(value) => return Ok(value),
                Err(e @ CoreError::ExtractionParse(_)) => {
                    log::warn!(
                        "Extractor: parse failure on attempt {}/{}: {}",
                        attempt + 1,
                        PARSE_RETRIES + 1,
                        e
                    );
                    last_err = Some(e);
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ExtractionParse("no attempts ran".into())))
    }
}

#[async_trait]
impl EntityExtractor for ChatExtractor {
    async fn extract(&self, input: &ExtractionInput) -> CoreResult<ExtractedEntities> {
        self.call_with_reparse(
            |attempt| prompts::entity_extraction_prompt(input, attempt),
            parse_entities_response,
        )
        .await
    }

    async fn compare(
        &self,
        a: &ExtractionInput,
        b: &ExtractionInput,
    ) -> CoreResult<SimilarityVerdict> {
        self.call_with_reparse(
            |attempt| prompts::similarity_prompt(a, b, attempt),
            parse_similarity_response,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_envelope_content_path() {
        let envelope: serde_json::Value = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "{\"overall_confidence\": 0.7}"}}]}"#,
        )
        .unwrap();
        let content = envelope["choices"][0]["message"]["content"].as_str().unwrap();
        let entities = parse_entities_response(content).unwrap();
        assert!((entities.overall_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_anthropic_envelope_content_path() {
        let envelope: serde_json::Value = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "{\"same_project\": true, \"score\": 0.8}"}]}"#,
        )
        .unwrap();
        let content = envelope["content"][0]["text"].as_str().unwrap();
        let verdict = parse_similarity_response(content).unwrap();
        assert!(verdict.same_project);
    }
}
