//! Shared harness for integration flows: a tempfile-backed state and a
//! scripted extractor whose answers are keyed by message subject.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use jobmail::db::users::UserRole;
use jobmail::db::{DbUser, Metastore};
use jobmail::error::CoreResult;
use jobmail::extractor::{
    EntityExtractor, ExtractedEntities, ExtractionInput, SimilarityVerdict,
};
use jobmail::gmail::{Address, ParsedMessage};
use jobmail::state::AppState;

/// Extractor with canned answers per subject; unknown subjects fall back to
/// an empty, low-confidence record.
pub struct ScriptedExtractor {
    by_subject: Mutex<HashMap<String, ExtractedEntities>>,
    verdict: Mutex<Option<SimilarityVerdict>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        ScriptedExtractor {
            by_subject: Mutex::new(HashMap::new()),
            verdict: Mutex::new(None),
        }
    }

    pub fn script(&self, subject: &str, entities: ExtractedEntities) {
        self.by_subject
            .lock()
            .unwrap()
            .insert(subject.to_string(), entities);
    }

    #[allow(dead_code)]
    pub fn script_similarity(&self, verdict: SimilarityVerdict) {
        *self.verdict.lock().unwrap() = Some(verdict);
    }
}

#[async_trait]
impl EntityExtractor for ScriptedExtractor {
    async fn extract(&self, input: &ExtractionInput) -> CoreResult<ExtractedEntities> {
        Ok(self
            .by_subject
            .lock()
            .unwrap()
            .get(&input.subject)
            .cloned()
            .unwrap_or_default())
    }

    async fn compare(
        &self,
        _a: &ExtractionInput,
        _b: &ExtractionInput,
    ) -> CoreResult<SimilarityVerdict> {
        Ok(self.verdict.lock().unwrap().clone().unwrap_or_default())
    }
}

pub fn temp_store() -> Metastore {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("flow.db");
    std::mem::forget(dir);
    Metastore::open(&path).expect("open store")
}

pub fn state_with(extractor: Arc<dyn EntityExtractor>) -> Arc<AppState> {
    let state = AppState::for_tests_with_extractor(temp_store(), extractor);
    seed_user(&state, "u1");
    state
}

pub fn seed_user(state: &Arc<AppState>, id: &str) {
    let store = state.store.lock().unwrap();
    store
        .upsert_user(&DbUser {
            id: id.to_string(),
            email: format!("{id}@example.test"),
            display_name: None,
            role: UserRole::User,
            api_token: Some(format!("token-{id}")),
            access_token: Some("ya29.test".into()),
            refresh_token: Some("1//refresh".into()),
            token_expiry: None,
            auth_expired: false,
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .expect("seed user");
}

pub fn message(id: &str, thread: &str, subject: &str, body: &str, sender: &str) -> ParsedMessage {
    ParsedMessage {
        id: id.to_string(),
        thread_id: thread.to_string(),
        subject: subject.to_string(),
        from: Address {
            name: String::new(),
            email: sender.to_string(),
        },
        snippet: body.chars().take(80).collect(),
        body_text: Some(body.to_string()),
        date: Some(chrono::Utc::now()),
        ..ParsedMessage::default()
    }
}
