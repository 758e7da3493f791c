//! Correction mining: turn repeated user overrides into resolver patterns.
//!
//! Runs on a slow cadence. A pattern is emitted only when the same key maps
//! to the same project with enough support AND never to a different project
//! (ambiguous signal yields nothing). Patterns are per-user.
//!
//! Pattern keys are SHA-256 digests of the canonical matched value; the raw
//! value rides in the pattern body so the resolver can still do partial
//! alias matching. Hashing keeps the key column uniform and lookups exact
//! regardless of what the value looks like.

use std::collections::HashMap;

use rusqlite::params;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::db::{CorrectionKind, DbCorrection, DbError, Metastore, PatternKind};
use crate::error::CoreResult;
use crate::normalize::{address_pattern_key, normalize_name};

/// How many corrections one pass examines per user.
const PASS_LIMIT: usize = 200;

/// Compute a deterministic pattern key: trim, case-fold, SHA-256, hex.
pub fn learned_key(raw: &str) -> String {
    let canonical = raw.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome counters for one learning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningPassStats {
    pub corrections_seen: usize,
    pub patterns_upserted: usize,
}

/// Accumulated evidence for one candidate pattern.
#[derive(Debug, Default)]
struct EvidenceEntry {
    /// The canonical matched value, stored in the pattern body.
    value: String,
    /// project -> support count.
    projects: HashMap<String, usize>,
}

/// (kind, hashed key) -> evidence.
type Evidence = HashMap<(PatternKind, String), EvidenceEntry>;

/// Mine this user's corrections into learning patterns.
///
/// Support is counted over the user's whole assign history, so evidence
/// accumulates across passes; the pass itself only runs when unprocessed
/// corrections exist, and marks them consumed at the end.
pub fn process_corrections(
    store: &Metastore,
    user_id: &str,
    min_support: usize,
) -> CoreResult<LearningPassStats> {
    let unprocessed = store.unprocessed_corrections(user_id, PASS_LIMIT)?;
    if unprocessed.is_empty() {
        return Ok(LearningPassStats::default());
    }

    let assigns = store.assign_corrections(user_id)?;
    let evidence = collect_evidence(&assigns);

    let mut upserted = 0;
    for ((kind, key), entry) in &evidence {
        // A key that ever pointed at two different projects is ambiguous.
        if entry.projects.len() != 1 {
            continue;
        }
        let Some((project_id, support)) = entry.projects.iter().next() else {
            continue;
        };
        if *support < min_support.max(1) {
            continue;
        }
        store.upsert_pattern_with_support(
            user_id,
            *kind,
            key,
            &json!({ "project_id": project_id, "value": entry.value }),
            *support,
        )?;
        upserted += 1;
        log::info!(
            "Learning: {} pattern '{}' -> {} (support {})",
            kind.as_str(),
            entry.value,
            project_id,
            support
        );
    }

    let ids: Vec<String> = unprocessed.iter().map(|c| c.id.clone()).collect();
    store.mark_corrections_processed(&ids)?;

    Ok(LearningPassStats {
        corrections_seen: unprocessed.len(),
        patterns_upserted: upserted,
    })
}

/// Pull pattern evidence out of assign corrections.
///
/// Three keys per correction: the sender address, the property address
/// (street + postcode from the mapping's audit projection), and the
/// normalized subject line (a repeated "assign mail titled X to project Y"
/// becomes an alias).
fn collect_evidence(assigns: &[DbCorrection]) -> Evidence {
    let mut evidence: Evidence = HashMap::new();

    let mut record = |kind: PatternKind, value: String, project_id: &str| {
        let entry = evidence
            .entry((kind, learned_key(&value)))
            .or_insert_with(|| EvidenceEntry {
                value,
                projects: HashMap::new(),
            });
        *entry.projects.entry(project_id.to_string()).or_insert(0) += 1;
    };

    for correction in assigns {
        let project_id = match correction
            .corrected
            .get("project_id")
            .and_then(|v| v.as_str())
        {
            Some(id) => id,
            None => continue,
        };

        if let Some(sender) = correction
            .corrected
            .get("sender_email")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            record(PatternKind::Sender, sender.to_lowercase(), project_id);
        }

        if let Some(street) = correction
            .corrected
            .get("street")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            let postcode = correction.corrected.get("postcode").and_then(|v| v.as_str());
            record(
                PatternKind::Address,
                address_pattern_key(street, postcode),
                project_id,
            );
        }

        if let Some(subject) = correction
            .corrected
            .get("subject")
            .and_then(|v| v.as_str())
        {
            let folded = normalize_name(subject);
            // Short subjects ("hi", "update") would learn nothing useful.
            if folded.split(' ').count() >= 2 && folded.len() >= 6 {
                record(PatternKind::Alias, folded, project_id);
            }
        }
    }

    evidence
}

impl Metastore {
    /// All assign corrections for a user, oldest first.
    pub fn assign_corrections(&self, user_id: &str) -> Result<Vec<DbCorrection>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT * FROM corrections
             WHERE user_id = ?1 AND kind = 'assign'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let original_raw: String = row.get("original")?;
            let corrected_raw: String = row.get("corrected")?;
            Ok(DbCorrection {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                kind: CorrectionKind::parse(&row.get::<_, String>("kind")?)
                    .unwrap_or(CorrectionKind::Assign),
                original: serde_json::from_str(&original_raw).unwrap_or(serde_json::Value::Null),
                corrected: serde_json::from_str(&corrected_raw).unwrap_or(serde_json::Value::Null),
                email_id: row.get("email_id")?,
                project_id: row.get("project_id")?,
                reason: row.get("reason")?,
                processed: row.get::<_, i32>("processed")? != 0,
                created_at: row.get("created_at")?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Upsert a pattern with an absolute support count (idempotent across
    /// passes; re-mining the same history does not inflate confidence).
    pub fn upsert_pattern_with_support(
        &self,
        user_id: &str,
        kind: PatternKind,
        pattern_key: &str,
        body: &serde_json::Value,
        support: usize,
    ) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        let support = support as i64;
        self.conn_ref().execute(
            "INSERT INTO learning_patterns
                (user_id, kind, pattern_key, body, confidence, usage_count,
                 is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, MIN(0.85, 0.5 + 0.05 * ?5), ?5, 1, ?6)
             ON CONFLICT (user_id, kind, pattern_key) DO UPDATE SET
                body = excluded.body,
                usage_count = MAX(usage_count, excluded.usage_count),
                confidence = MIN(0.85, 0.5 + 0.05 * MAX(usage_count, excluded.usage_count))",
            params![user_id, kind.as_str(), pattern_key, body.to_string(), support, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrections::apply_assign;
    use crate::db::mappings::test_mapping;
    use crate::db::projects::test_project;
    use crate::db::test_support::temp_store;
    use crate::db::NewMapping;

    fn store_with_projects() -> Metastore {
        let store = temp_store();
        store.insert_project(&test_project("u1", "pA", "Baker Job")).unwrap();
        store.insert_project(&test_project("u1", "pB", "Smith Reno")).unwrap();
        store
    }

    fn assign_from_sender(store: &Metastore, email_id: &str, sender: &str, project: &str) {
        let mapping = NewMapping {
            sender_email: Some(sender.to_string()),
            subject: Some("Smith Res carpentry works".into()),
            ..test_mapping("u1", "pA", email_id)
        };
        store.assign_mapping(&mapping).unwrap();
        apply_assign(store, 3, "u1", email_id, project, None).unwrap();
    }

    #[test]
    fn test_learned_key_is_stable_and_case_folded() {
        assert_eq!(learned_key("Carol@Client.Test"), learned_key("carol@client.test"));
        assert_eq!(learned_key(" smith res "), learned_key("smith res"));
        assert_ne!(learned_key("smith res"), learned_key("smith reno"));
        // Hex SHA-256 digest
        assert_eq!(learned_key("x").len(), 64);
        assert!(learned_key("x").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_repeated_assigns_become_sender_pattern() {
        let store = store_with_projects();
        for i in 0..3 {
            assign_from_sender(&store, &format!("m{i}"), "carol@client.test", "pB");
        }

        let stats = process_corrections(&store, "u1", 3).unwrap();
        assert_eq!(stats.corrections_seen, 3);
        assert!(stats.patterns_upserted >= 1);

        let patterns = store.active_patterns("u1").unwrap();
        let sender = patterns
            .iter()
            .find(|p| p.kind == PatternKind::Sender)
            .expect("sender pattern");
        assert_eq!(sender.pattern_key, learned_key("carol@client.test"));
        assert_eq!(sender.matched_value(), Some("carol@client.test"));
        assert_eq!(sender.project_id(), Some("pB"));
        assert_eq!(sender.usage_count, 3);
        assert!((sender.confidence - 0.65).abs() < 0.01);
    }

    #[test]
    fn test_below_support_emits_nothing() {
        let store = store_with_projects();
        assign_from_sender(&store, "m1", "carol@client.test", "pB");
        assign_from_sender(&store, "m2", "carol@client.test", "pB");

        let stats = process_corrections(&store, "u1", 3).unwrap();
        assert_eq!(stats.patterns_upserted, 0);
        assert!(store.active_patterns("u1").unwrap().is_empty());
    }

    #[test]
    fn test_support_accumulates_across_passes() {
        let store = store_with_projects();
        assign_from_sender(&store, "m1", "carol@client.test", "pB");
        assign_from_sender(&store, "m2", "carol@client.test", "pB");
        process_corrections(&store, "u1", 3).unwrap();

        // Third assign arrives later; whole history counts.
        assign_from_sender(&store, "m3", "carol@client.test", "pB");
        let stats = process_corrections(&store, "u1", 3).unwrap();
        assert_eq!(stats.corrections_seen, 1);
        assert!(stats.patterns_upserted >= 1);
    }

    #[test]
    fn test_conflicting_targets_are_ambiguous() {
        let store = store_with_projects();
        assign_from_sender(&store, "m1", "carol@client.test", "pB");
        assign_from_sender(&store, "m2", "carol@client.test", "pB");
        assign_from_sender(&store, "m3", "carol@client.test", "pB");
        // Same sender corrected to a different project: signal is ambiguous.
        assign_from_sender(&store, "m4", "carol@client.test", "pA");

        process_corrections(&store, "u1", 3).unwrap();
        let patterns = store.active_patterns("u1").unwrap();
        assert!(
            patterns.iter().all(|p| p.kind != PatternKind::Sender),
            "ambiguous sender must not form a pattern"
        );
    }

    #[test]
    fn test_reprocessing_does_not_inflate_confidence() {
        let store = store_with_projects();
        for i in 0..3 {
            assign_from_sender(&store, &format!("m{i}"), "carol@client.test", "pB");
        }
        process_corrections(&store, "u1", 3).unwrap();
        let first = store.active_patterns("u1").unwrap();

        // New unrelated correction triggers another pass over the history.
        assign_from_sender(&store, "m9", "dave@other.test", "pA");
        process_corrections(&store, "u1", 3).unwrap();

        let second = store.active_patterns("u1").unwrap();
        let carol_key = learned_key("carol@client.test");
        let before = first
            .iter()
            .find(|p| p.kind == PatternKind::Sender && p.pattern_key == carol_key)
            .unwrap();
        let after = second
            .iter()
            .find(|p| p.kind == PatternKind::Sender && p.pattern_key == carol_key)
            .unwrap();
        assert_eq!(before.usage_count, after.usage_count);
        assert!((before.confidence - after.confidence).abs() < 1e-9);
    }

    #[test]
    fn test_alias_pattern_from_repeated_subjects() {
        let store = store_with_projects();
        for i in 0..3 {
            assign_from_sender(&store, &format!("m{i}"), "carol@client.test", "pB");
        }
        process_corrections(&store, "u1", 3).unwrap();

        let patterns = store.active_patterns("u1").unwrap();
        let alias = patterns
            .iter()
            .find(|p| p.kind == PatternKind::Alias)
            .expect("alias pattern");
        assert_eq!(alias.pattern_key, learned_key("smith res carpentry works"));
        assert_eq!(alias.matched_value(), Some("smith res carpentry works"));
        assert_eq!(alias.project_id(), Some("pB"));
    }

    #[test]
    fn test_address_pattern_from_repeated_assigns() {
        let store = store_with_projects();
        for i in 0..3 {
            let mapping = NewMapping {
                sender_email: Some(format!("sender{i}@various.test")),
                subject: None,
                street: Some("12 Baker Street".into()),
                postcode: Some("3000".into()),
                ..test_mapping("u1", "pA", &format!("m{i}"))
            };
            store.assign_mapping(&mapping).unwrap();
            apply_assign(&store, 3, "u1", &format!("m{i}"), "pB", None).unwrap();
        }

        let stats = process_corrections(&store, "u1", 3).unwrap();
        assert!(stats.patterns_upserted >= 1);

        let patterns = store.active_patterns("u1").unwrap();
        let address = patterns
            .iter()
            .find(|p| p.kind == PatternKind::Address)
            .expect("address pattern");
        // "12 Baker Street" and "12 Baker St" fold to the same key
        assert_eq!(
            address.pattern_key,
            learned_key(&address_pattern_key("12 Baker St", Some("3000")))
        );
        assert_eq!(address.project_id(), Some("pB"));
        // Senders all differ, so no sender pattern formed
        assert!(patterns.iter().all(|p| p.kind != PatternKind::Sender));
    }

    #[test]
    fn test_empty_pass_is_a_noop() {
        let store = store_with_projects();
        let stats = process_corrections(&store, "u1", 3).unwrap();
        assert_eq!(stats, LearningPassStats::default());
    }
}
