//! User corrections: assign, unassign, merge, split, rename.
//!
//! Every override snapshots the state it replaced and the state it asked
//! for, appends to the correction log, and replays the change against
//! projects and mappings in one transaction. The log is training signal
//! (the learning pass derives patterns from it out-of-band) and audit
//! trail: a project referenced by corrections is archived, never deleted.

use serde_json::json;
use uuid::Uuid;

use crate::db::{
    AssociationMethod, CorrectionKind, DbCorrection, DbError, DbMapping, DbProject, Metastore,
    NewMapping, ProjectStatus,
};
use crate::error::{CoreError, CoreResult};
use crate::queue::{enqueue_reflection, ReflectionTask};

/// What a replayed correction did, for the HTTP response.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub correction_id: String,
    pub project_id: Option<String>,
    pub moved_mappings: usize,
}

fn mapping_snapshot(mapping: Option<&DbMapping>) -> serde_json::Value {
    match mapping {
        Some(m) => json!({
            "project_id": m.project_id,
            "email_id": m.email_id,
            "thread_id": m.thread_id,
            "confidence": m.confidence,
            "association_method": m.association_method.as_str(),
            "needs_review": m.needs_review,
            "subject": m.subject,
            "sender_email": m.sender_email,
            "street": m.street,
            "postcode": m.postcode,
        }),
        None => serde_json::Value::Null,
    }
}

fn project_snapshot(project: &DbProject) -> serde_json::Value {
    json!({
        "project_id": project.id,
        "name": project.name,
        "aliases": project.aliases,
        "job_numbers": project.job_numbers,
        "status": project.status.as_str(),
        "email_count": project.email_count,
        "client_email": project.client.email,
    })
}

fn new_correction(
    user_id: &str,
    kind: CorrectionKind,
    original: serde_json::Value,
    corrected: serde_json::Value,
    email_id: Option<String>,
    project_id: Option<String>,
    reason: Option<&str>,
) -> DbCorrection {
    DbCorrection {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kind,
        original,
        corrected,
        email_id,
        project_id,
        reason: reason.map(str::to_string),
        processed: false,
        created_at: String::new(),
    }
}

/// Manually assign a message to a project.
pub fn apply_assign(
    store: &Metastore,
    max_attempts: i32,
    user_id: &str,
    email_id: &str,
    project_id: &str,
    reason: Option<&str>,
) -> CoreResult<CorrectionOutcome> {
    let project = store
        .get_project(user_id, project_id)?
        .ok_or_else(|| CoreError::NotFound(format!("project {project_id}")))?;

    let outcome = store.with_transaction(|s| {
        let prior = s.get_active_mapping(user_id, email_id)?;

        // Preserve the audit projection from the prior mapping when present.
        let mapping = NewMapping {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            email_id: email_id.to_string(),
            thread_id: prior.as_ref().and_then(|m| m.thread_id.clone()),
            confidence: 1.0,
            association_method: Some(AssociationMethod::Manual),
            needs_review: false,
            split_from_thread: false,
            subject: prior.as_ref().and_then(|m| m.subject.clone()),
            sender_email: prior.as_ref().and_then(|m| m.sender_email.clone()),
            sender_name: prior.as_ref().and_then(|m| m.sender_name.clone()),
            snippet: prior.as_ref().and_then(|m| m.snippet.clone()),
            message_date: prior.as_ref().and_then(|m| m.message_date.clone()),
            street: prior.as_ref().and_then(|m| m.street.clone()),
            postcode: prior.as_ref().and_then(|m| m.postcode.clone()),
        };
        let mapping_id = s.assign_mapping(&mapping)?;

        let mut previous_project_id = None;
        if let Some(prior) = &prior {
            if prior.project_id != project_id {
                s.recount_project(user_id, &prior.project_id)?;
                previous_project_id = Some(prior.project_id.clone());
            }
        }
        s.recount_project(user_id, project_id)?;
        s.set_attachment_project(user_id, email_id, Some(project_id))?;

        enqueue_reflection(
            s,
            &ReflectionTask {
                user_id: user_id.to_string(),
                mapping_id,
                email_id: email_id.to_string(),
                thread_id: mapping.thread_id.clone(),
                project_id: project_id.to_string(),
                previous_project_id,
                remove: false,
            },
            max_attempts,
        )?;

        let correction = new_correction(
            user_id,
            CorrectionKind::Assign,
            mapping_snapshot(prior.as_ref()),
            json!({
                "project_id": project_id,
                "email_id": email_id,
                "association_method": "manual",
                "subject": mapping.subject,
                "sender_email": mapping.sender_email,
                "street": mapping.street,
                "postcode": mapping.postcode,
            }),
            Some(email_id.to_string()),
            Some(project_id.to_string()),
            reason,
        );
        s.insert_correction(&correction)?;

        Ok(CorrectionOutcome {
            correction_id: correction.id,
            project_id: Some(project_id.to_string()),
            moved_mappings: 1,
        })
    })?;

    log::info!(
        "Corrections: assigned {} to {} ({})",
        email_id,
        project.name,
        user_id
    );
    Ok(outcome)
}

/// Manually remove a message from its project.
pub fn apply_unassign(
    store: &Metastore,
    max_attempts: i32,
    user_id: &str,
    email_id: &str,
    reason: Option<&str>,
) -> CoreResult<CorrectionOutcome> {
    store.with_transaction(|s| {
        let prior = s
            .get_active_mapping(user_id, email_id)?
            .ok_or_else(|| DbError::NotFound(format!("no active mapping for {email_id}")))?;

        s.deactivate_mapping(user_id, email_id)?;
        s.recount_project(user_id, &prior.project_id)?;
        s.set_attachment_project(user_id, email_id, None)?;

        enqueue_reflection(
            s,
            &ReflectionTask {
                user_id: user_id.to_string(),
                mapping_id: prior.id,
                email_id: email_id.to_string(),
                thread_id: prior.thread_id.clone(),
                project_id: prior.project_id.clone(),
                previous_project_id: None,
                remove: true,
            },
            max_attempts,
        )?;

        let correction = new_correction(
            user_id,
            CorrectionKind::Unassign,
            mapping_snapshot(Some(&prior)),
            serde_json::Value::Null,
            Some(email_id.to_string()),
            Some(prior.project_id.clone()),
            reason,
        );
        s.insert_correction(&correction)?;

        Ok(CorrectionOutcome {
            correction_id: correction.id,
            project_id: Some(prior.project_id),
            moved_mappings: 1,
        })
    })
    .map_err(CoreError::from)
}

/// Merge `source` into `target`: all mappings re-pointed, aliases and job
/// numbers unioned, counters recomputed, source archived for audit.
pub fn apply_merge(
    store: &Metastore,
    max_attempts: i32,
    user_id: &str,
    source_id: &str,
    target_id: &str,
    reason: Option<&str>,
) -> CoreResult<CorrectionOutcome> {
    if source_id == target_id {
        return Err(CoreError::Invalid("cannot merge a project into itself".into()));
    }
    let source = store
        .get_project(user_id, source_id)?
        .ok_or_else(|| CoreError::NotFound(format!("project {source_id}")))?;
    let target = store
        .get_project(user_id, target_id)?
        .ok_or_else(|| CoreError::NotFound(format!("project {target_id}")))?;

    store.with_transaction(|s| {
        let moved_mappings = s.project_mappings(user_id, source_id, i64::MAX as usize)?;
        let moved = s.repoint_project_mappings(user_id, source_id, target_id)?;

        // The source's name and aliases become aliases of the target.
        let mut aliases = vec![source.name.clone()];
        aliases.extend(source.aliases.clone());
        s.add_project_aliases(user_id, target_id, &aliases)?;
        s.add_project_job_numbers(user_id, target_id, &source.job_numbers)?;

        s.recount_project(user_id, source_id)?;
        s.recount_project(user_id, target_id)?;
        s.set_project_status(user_id, source_id, ProjectStatus::Archived)?;

        for mapping in &moved_mappings {
            s.set_attachment_project(user_id, &mapping.email_id, Some(target_id))?;
            enqueue_reflection(
                s,
                &ReflectionTask {
                    user_id: user_id.to_string(),
                    mapping_id: mapping.id,
                    email_id: mapping.email_id.clone(),
                    thread_id: mapping.thread_id.clone(),
                    project_id: target_id.to_string(),
                    previous_project_id: Some(source_id.to_string()),
                    remove: false,
                },
                max_attempts,
            )?;
        }

        let correction = new_correction(
            user_id,
            CorrectionKind::Merge,
            json!({
                "source": project_snapshot(&source),
                "target": project_snapshot(&target),
            }),
            json!({
                "merged_into": target_id,
                "moved_mappings": moved,
            }),
            None,
            Some(target_id.to_string()),
            reason,
        );
        s.insert_correction(&correction)?;

        Ok(CorrectionOutcome {
            correction_id: correction.id,
            project_id: Some(target_id.to_string()),
            moved_mappings: moved,
        })
    })
    .map_err(CoreError::from)
}

/// Split the given messages out of `source` into a new project.
pub fn apply_split(
    store: &Metastore,
    max_attempts: i32,
    user_id: &str,
    source_id: &str,
    message_ids: &[String],
    new_name: &str,
    reason: Option<&str>,
) -> CoreResult<CorrectionOutcome> {
    if message_ids.is_empty() {
        return Err(CoreError::Invalid("split needs at least one message".into()));
    }
    if new_name.trim().is_empty() {
        return Err(CoreError::Invalid("split needs a project name".into()));
    }
    let source = store
        .get_project(user_id, source_id)?
        .ok_or_else(|| CoreError::NotFound(format!("project {source_id}")))?;

    store.with_transaction(|s| {
        let new_project = DbProject {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: new_name.trim().to_string(),
            aliases: Vec::new(),
            address: Default::default(),
            client: Default::default(),
            project_type: source.project_type.clone(),
            job_numbers: Vec::new(),
            status: ProjectStatus::Active,
            email_count: 0,
            last_email_at: None,
            created_from_email_id: message_ids.first().cloned(),
            confidence: 1.0,
            needs_review: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        s.insert_project(&new_project)?;

        let moved = s.repoint_mappings_by_email(user_id, message_ids, &new_project.id)?;
        s.recount_project(user_id, source_id)?;
        s.recount_project(user_id, &new_project.id)?;

        for email_id in message_ids {
            if let Some(mapping) = s.get_active_mapping(user_id, email_id)? {
                s.set_attachment_project(user_id, email_id, Some(&new_project.id))?;
                enqueue_reflection(
                    s,
                    &ReflectionTask {
                        user_id: user_id.to_string(),
                        mapping_id: mapping.id,
                        email_id: email_id.clone(),
                        thread_id: mapping.thread_id.clone(),
                        project_id: new_project.id.clone(),
                        previous_project_id: Some(source_id.to_string()),
                        remove: false,
                    },
                    max_attempts,
                )?;
            }
        }

        let correction = new_correction(
            user_id,
            CorrectionKind::Split,
            project_snapshot(&source),
            json!({
                "new_project_id": new_project.id,
                "new_name": new_project.name,
                "message_ids": message_ids,
            }),
            None,
            Some(new_project.id.clone()),
            reason,
        );
        s.insert_correction(&correction)?;

        Ok(CorrectionOutcome {
            correction_id: correction.id,
            project_id: Some(new_project.id.clone()),
            moved_mappings: moved,
        })
    })
    .map_err(CoreError::from)
}

/// Rename a project and/or change its status. The old name survives as an
/// alias so historical matching keeps working.
pub fn apply_rename(
    store: &Metastore,
    user_id: &str,
    project_id: &str,
    new_name: Option<&str>,
    add_aliases: &[String],
    status: Option<ProjectStatus>,
    reason: Option<&str>,
) -> CoreResult<CorrectionOutcome> {
    let project = store
        .get_project(user_id, project_id)?
        .ok_or_else(|| CoreError::NotFound(format!("project {project_id}")))?;

    store.with_transaction(|s| {
        if let Some(name) = new_name {
            let name = name.trim();
            if !name.is_empty() && name != project.name {
                s.rename_project(user_id, project_id, name)?;
                s.add_project_aliases(user_id, project_id, &[project.name.clone()])?;
            }
        }
        if !add_aliases.is_empty() {
            s.add_project_aliases(user_id, project_id, add_aliases)?;
        }
        if let Some(status) = status {
            s.set_project_status(user_id, project_id, status)?;
        }

        let correction = new_correction(
            user_id,
            CorrectionKind::Rename,
            project_snapshot(&project),
            json!({
                "name": new_name.unwrap_or(&project.name),
                "added_aliases": add_aliases,
                "status": status.map(|s| s.as_str()),
            }),
            None,
            Some(project_id.to_string()),
            reason,
        );
        s.insert_correction(&correction)?;

        Ok(CorrectionOutcome {
            correction_id: correction.id,
            project_id: Some(project_id.to_string()),
            moved_mappings: 0,
        })
    })
    .map_err(CoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mappings::test_mapping;
    use crate::db::projects::test_project;
    use crate::db::test_support::temp_store;
    use crate::db::QUEUE_REFLECT;

    fn seeded_store() -> Metastore {
        let store = temp_store();
        store.insert_project(&test_project("u1", "pA", "Baker Job")).unwrap();
        store.insert_project(&test_project("u1", "pB", "Smith Reno")).unwrap();
        store
    }

    #[test]
    fn test_assign_moves_mapping_and_records_correction() {
        let store = seeded_store();
        store.assign_mapping(&test_mapping("u1", "pA", "m1")).unwrap();
        store.recount_project("u1", "pA").unwrap();

        let outcome = apply_assign(&store, 3, "u1", "m1", "pB", Some("wrong job")).unwrap();
        assert_eq!(outcome.project_id.as_deref(), Some("pB"));

        let mapping = store.get_active_mapping("u1", "m1").unwrap().unwrap();
        assert_eq!(mapping.project_id, "pB");
        assert_eq!(mapping.association_method, AssociationMethod::Manual);
        assert!((mapping.confidence - 1.0).abs() < 1e-9);

        // Both counters recomputed
        assert_eq!(store.get_project("u1", "pA").unwrap().unwrap().email_count, 0);
        assert_eq!(store.get_project("u1", "pB").unwrap().unwrap().email_count, 1);

        let corrections = store.unprocessed_corrections("u1", 10).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].kind, CorrectionKind::Assign);
        assert_eq!(corrections[0].original["project_id"], "pA");
        assert_eq!(corrections[0].reason.as_deref(), Some("wrong job"));
    }

    #[test]
    fn test_assign_then_reverse_restores_prior_state() {
        let store = seeded_store();
        store.assign_mapping(&test_mapping("u1", "pA", "m1")).unwrap();
        store.recount_project("u1", "pA").unwrap();
        let before = store.get_project("u1", "pA").unwrap().unwrap();

        apply_assign(&store, 3, "u1", "m1", "pB", None).unwrap();
        apply_assign(&store, 3, "u1", "m1", "pA", None).unwrap();

        let mapping = store.get_active_mapping("u1", "m1").unwrap().unwrap();
        assert_eq!(mapping.project_id, "pA");
        let after = store.get_project("u1", "pA").unwrap().unwrap();
        assert_eq!(after.email_count, before.email_count);
        // Two corrections recorded as learning artefacts
        assert_eq!(store.unprocessed_corrections("u1", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_unassign_requires_active_mapping() {
        let store = seeded_store();
        let err = apply_unassign(&store, 3, "u1", "ghost", None);
        assert!(err.is_err());

        store.assign_mapping(&test_mapping("u1", "pA", "m1")).unwrap();
        let outcome = apply_unassign(&store, 3, "u1", "m1", None).unwrap();
        assert_eq!(outcome.project_id.as_deref(), Some("pA"));
        assert!(store.get_active_mapping("u1", "m1").unwrap().is_none());
    }

    #[test]
    fn test_merge_unions_and_archives() {
        let store = seeded_store();
        store
            .add_project_job_numbers("u1", "pA", &["087".into()])
            .unwrap();
        store.assign_mapping(&test_mapping("u1", "pA", "m1")).unwrap();
        store.assign_mapping(&test_mapping("u1", "pA", "m2")).unwrap();
        store.assign_mapping(&test_mapping("u1", "pB", "m3")).unwrap();

        let outcome = apply_merge(&store, 3, "u1", "pA", "pB", None).unwrap();
        assert_eq!(outcome.moved_mappings, 2);

        let target = store.get_project("u1", "pB").unwrap().unwrap();
        assert_eq!(target.email_count, 3);
        assert!(target.aliases.contains(&"Baker Job".to_string()));
        assert!(target.job_numbers.contains(&"087".to_string()));

        let source = store.get_project("u1", "pA").unwrap().unwrap();
        assert_eq!(source.status, ProjectStatus::Archived);
        assert_eq!(source.email_count, 0);

        // Reflection owed for each moved mapping
        let stats = store.queue_stats(QUEUE_REFLECT).unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[test]
    fn test_merge_into_self_rejected() {
        let store = seeded_store();
        assert!(apply_merge(&store, 3, "u1", "pA", "pA", None).is_err());
    }

    #[test]
    fn test_split_creates_project_with_exact_messages() {
        let store = seeded_store();
        for i in 0..5 {
            store
                .assign_mapping(&test_mapping("u1", "pA", &format!("m{i}")))
                .unwrap();
        }
        store.recount_project("u1", "pA").unwrap();

        let split_ids = vec!["m1".to_string(), "m3".to_string()];
        let outcome =
            apply_split(&store, 3, "u1", "pA", &split_ids, "Baker Annex", None).unwrap();
        assert_eq!(outcome.moved_mappings, 2);

        let new_id = outcome.project_id.unwrap();
        let annex = store.get_project("u1", &new_id).unwrap().unwrap();
        assert_eq!(annex.name, "Baker Annex");
        assert_eq!(annex.email_count, 2);
        assert_eq!(store.get_project("u1", "pA").unwrap().unwrap().email_count, 3);

        for id in &split_ids {
            let mapping = store.get_active_mapping("u1", id).unwrap().unwrap();
            assert_eq!(mapping.project_id, new_id);
        }
    }

    #[test]
    fn test_split_validates_input() {
        let store = seeded_store();
        assert!(apply_split(&store, 3, "u1", "pA", &[], "X", None).is_err());
        assert!(
            apply_split(&store, 3, "u1", "pA", &["m1".to_string()], "  ", None).is_err()
        );
    }

    #[test]
    fn test_rename_keeps_old_name_as_alias() {
        let store = seeded_store();
        apply_rename(
            &store,
            "u1",
            "pA",
            Some("Baker Street Stage 1"),
            &[],
            None,
            None,
        )
        .unwrap();

        let project = store.get_project("u1", "pA").unwrap().unwrap();
        assert_eq!(project.name, "Baker Street Stage 1");
        assert!(project.aliases.contains(&"Baker Job".to_string()));
    }

    #[test]
    fn test_failed_correction_rolls_back_whole_change() {
        let store = seeded_store();
        store.assign_mapping(&test_mapping("u1", "pA", "m1")).unwrap();
        // Target project does not exist: nothing may change.
        let err = apply_assign(&store, 3, "u1", "m1", "ghost", None);
        assert!(err.is_err());
        let mapping = store.get_active_mapping("u1", "m1").unwrap().unwrap();
        assert_eq!(mapping.project_id, "pA");
        assert!(store.unprocessed_corrections("u1", 10).unwrap().is_empty());
        let stats = store.queue_stats(QUEUE_REFLECT).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
    }
}
