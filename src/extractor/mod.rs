//! Language-model-backed entity extraction and pairwise similarity.
//!
//! The pipeline depends only on the `EntityExtractor` trait; which model
//! answers (or whether one answers at all) is configuration. Responses must
//! parse into the schemas below or the call fails `ExtractionParse`; after
//! two reformatting retries the owning queue item is dead-lettered with the
//! raw output attached.
//!
//! Extractors are stateless between calls: any context (existing project
//! names) arrives in the input, never from hidden session state.

pub mod http;
pub mod prompts;
pub mod stub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AiProvider, Config};
use crate::error::{CoreError, CoreResult};

/// What the extractor sees of one message. Bodies live only here, for the
/// duration of one call.
#[derive(Debug, Clone, Default)]
pub struct ExtractionInput {
    pub subject: String,
    pub body: String,
    pub sender_name: Option<String>,
    pub sender_email: String,
    /// Names of the user's existing projects, passed for disambiguation.
    pub existing_projects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameCandidate {
    pub value: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedAddress {
    #[serde(default)]
    pub full: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

impl ExtractedAddress {
    pub fn is_empty(&self) -> bool {
        self.street.is_none() && self.full.is_none() && self.postcode.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNumber {
    pub value: String,
    /// Where it was found: subject, body, signature, attachment-filename.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Structured entity record extracted from one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub project_name: Option<NameCandidate>,
    /// Further independent project-name candidates (multi-project mail).
    #[serde(default)]
    pub alternative_names: Vec<NameCandidate>,
    #[serde(default)]
    pub address: Option<ExtractedAddress>,
    #[serde(default)]
    pub job_numbers: Vec<JobNumber>,
    #[serde(default)]
    pub client: Option<ClientInfo>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub overall_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingIndicators {
    #[serde(default)]
    pub project_name: bool,
    #[serde(default)]
    pub address: bool,
    #[serde(default)]
    pub job_number: bool,
    #[serde(default)]
    pub client: bool,
    #[serde(default)]
    pub content: bool,
}

/// Pairwise same-project verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimilarityVerdict {
    #[serde(default)]
    pub same_project: bool,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub matching_indicators: MatchingIndicators,
    #[serde(default)]
    pub reason: String,
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, input: &ExtractionInput) -> CoreResult<ExtractedEntities>;

    async fn compare(
        &self,
        a: &ExtractionInput,
        b: &ExtractionInput,
    ) -> CoreResult<SimilarityVerdict>;
}

/// Construct the configured extractor.
pub fn build_extractor(config: &Config) -> Arc<dyn EntityExtractor> {
    match config.ai_provider {
        AiProvider::Stub => Arc::new(stub::StubExtractor::new()),
        provider => Arc::new(http::ChatExtractor::new(
            provider,
            config.ai_model.clone(),
            config.ai_api_key.clone().unwrap_or_default(),
            config.ai_timeout_ms,
        )),
    }
}

/// Strip a fenced code block if the model wrapped its JSON in one.
pub(crate) fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
        return after.trim();
    }
    trimmed
}

fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Parse and validate an entity response. Confidences outside [0,1] clamp;
/// empty job-number values drop; unparseable JSON is an `ExtractionParse`.
pub fn parse_entities_response(raw: &str) -> CoreResult<ExtractedEntities> {
    let cleaned = strip_fences(raw);
    let mut entities: ExtractedEntities = serde_json::from_str(cleaned)
        .map_err(|e| CoreError::ExtractionParse(format!("{e}; raw: {}", truncate(raw, 400))))?;

    entities.overall_confidence = clamp_unit(entities.overall_confidence);
    if let Some(name) = &mut entities.project_name {
        name.confidence = clamp_unit(name.confidence);
        if name.value.trim().is_empty() {
            entities.project_name = None;
        }
    }
    for alt in &mut entities.alternative_names {
        alt.confidence = clamp_unit(alt.confidence);
    }
    entities.alternative_names.retain(|a| !a.value.trim().is_empty());
    entities.job_numbers.retain(|j| !j.value.trim().is_empty());
    for job in &mut entities.job_numbers {
        job.confidence = clamp_unit(job.confidence);
    }
    if let Some(addr) = &mut entities.address {
        addr.confidence = clamp_unit(addr.confidence);
        if addr.is_empty() {
            entities.address = None;
        }
    }
    Ok(entities)
}

/// Parse and validate a similarity response.
pub fn parse_similarity_response(raw: &str) -> CoreResult<SimilarityVerdict> {
    let cleaned = strip_fences(raw);
    let mut verdict: SimilarityVerdict = serde_json::from_str(cleaned)
        .map_err(|e| CoreError::ExtractionParse(format!("{e}; raw: {}", truncate(raw, 400))))?;
    verdict.score = clamp_unit(verdict.score);
    Ok(verdict)
}

fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entities_happy_path() {
        let raw = r#"{
            "project_name": {"value": "12 Baker St renovation", "confidence": 0.85, "aliases": ["Baker St reno"]},
            "address": {"street": "12 Baker St", "postcode": "3000", "confidence": 0.9},
            "job_numbers": [{"value": "2024-087", "source": "body", "confidence": 0.95}],
            "client": {"name": "Alice", "email": "alice@builder.test", "confidence": 0.7},
            "project_type": "renovation",
            "keywords": ["quote", "renovation"],
            "overall_confidence": 0.88
        }"#;
        let entities = parse_entities_response(raw).unwrap();
        assert_eq!(entities.project_name.as_ref().unwrap().value, "12 Baker St renovation");
        assert_eq!(entities.job_numbers.len(), 1);
        assert!((entities.overall_confidence - 0.88).abs() < 1e-9);
    }

    #[test]
    fn test_parse_entities_strips_markdown_fences() {
        let raw = "```json\n{\"overall_confidence\": 0.5}\n```";
        let entities = parse_entities_response(raw).unwrap();
        assert!((entities.overall_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_entities_clamps_and_drops_empties() {
        let raw = r#"{
            "project_name": {"value": "  ", "confidence": 2.0},
            "job_numbers": [{"value": "", "confidence": 0.5}, {"value": "088", "confidence": -1}],
            "address": {"confidence": 0.4},
            "overall_confidence": 1.7
        }"#;
        let entities = parse_entities_response(raw).unwrap();
        assert!(entities.project_name.is_none());
        assert!(entities.address.is_none());
        assert_eq!(entities.job_numbers.len(), 1);
        assert_eq!(entities.job_numbers[0].confidence, 0.0);
        assert_eq!(entities.overall_confidence, 1.0);
    }

    #[test]
    fn test_parse_entities_rejects_non_json() {
        let err = parse_entities_response("I could not find a project.").unwrap_err();
        assert!(matches!(err, CoreError::ExtractionParse(_)));
    }

    #[test]
    fn test_parse_similarity() {
        let raw = r#"{
            "same_project": true,
            "score": 0.92,
            "matching_indicators": {"address": true, "job_number": true},
            "reason": "Same address and job number"
        }"#;
        let verdict = parse_similarity_response(raw).unwrap();
        assert!(verdict.same_project);
        assert!(verdict.matching_indicators.address);
        assert!(!verdict.matching_indicators.client);
    }

    #[test]
    fn test_strip_fences_variants() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("prose ```json\n{}\n``` more"), "{}");
    }
}
