//! Project resolution: which project does a message belong to?
//!
//! Deterministic signal scoring over the user's projects, with documented
//! tie-breaks. Signals in priority order: property address, job number,
//! thread consensus, project name/alias, client email, model-reported
//! similarity. A candidate's score is the sum of its matched signal weights
//! times the extractor's overall confidence, with the address and job
//! signals also imposing a floor, because a street match or a job-number
//! match is decisive on its own no matter how little else was extracted.
//!
//! Resolution for one `(user, thread)` is a critical section; messages of
//! the same thread resolve serially so the thread-consensus signal stays
//! stable under any arrival interleaving.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::params;

use crate::config::Config;
use crate::db::{
    AssociationMethod, DbError, DbMapping, DbPattern, DbProject, Metastore, NewMapping,
    PatternKind, ProjectAddress, ProjectClient, ProjectStatus, SharedStore,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, UiEvent};
use crate::extractor::{EntityExtractor, ExtractedEntities, ExtractionInput};
use crate::gmail::ParsedMessage;
use crate::learning::learned_key;
use crate::normalize::{
    address_pattern_key, job_numbers_match, normalize_name, normalize_postcode, normalize_street,
};
use crate::queue::{enqueue_reflection, ReflectionTask};
use crate::util::KeyedLocks;

/// Signal weights, in decreasing priority.
pub const WEIGHT_ADDRESS: f64 = 0.45;
pub const WEIGHT_JOB_NUMBER: f64 = 0.35;
pub const WEIGHT_THREAD: f64 = 0.30;
pub const WEIGHT_NAME: f64 = 0.25;
pub const WEIGHT_CLIENT: f64 = 0.15;
pub const WEIGHT_SIMILARITY: f64 = 0.10;

/// Score floors for decisive single signals (× overall confidence).
const FLOOR_ADDRESS: f64 = 0.90;
const FLOOR_JOB_NUMBER: f64 = 0.80;

/// Learned-pattern contribution to a project's score.
const PATTERN_BONUS: f64 = 0.10;

/// Candidates within this window of the best are "ambiguous peers".
const TIE_WINDOW: f64 = 0.05;

/// Similarity sampling cap: recent messages compared per candidate.
const SIMILARITY_SAMPLES: usize = 3;

/// Extraction name candidates at or above this confidence count as
/// independent projects for multi-project detection.
const MULTI_PROJECT_NAME_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub auto: f64,
    pub review: f64,
    pub create: f64,
}

impl From<&Config> for ResolverConfig {
    fn from(config: &Config) -> Self {
        ResolverConfig {
            auto: config.confidence_auto,
            review: config.confidence_review,
            create: config.confidence_new,
        }
    }
}

/// Which signals matched for one candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchedSignals {
    pub address: bool,
    pub job_number: bool,
    pub thread: bool,
    pub name: bool,
    pub client: bool,
    pub similarity: bool,
    pub pattern_bonus: f64,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub project: DbProject,
    pub matched: MatchedSignals,
    pub score: f64,
}

/// What resolution did.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    /// None when ambiguity assigned nothing.
    pub project_id: Option<String>,
    pub mapping_id: Option<i64>,
    pub created_project: bool,
    pub needs_review: bool,
    pub split_from_thread: bool,
    pub score: f64,
}

pub struct Resolver {
    store: SharedStore,
    extractor: Arc<dyn EntityExtractor>,
    events: EventBus,
    locks: Arc<KeyedLocks>,
    cfg: ResolverConfig,
    queue_max_attempts: i32,
}

impl Resolver {
    pub fn new(
        store: SharedStore,
        extractor: Arc<dyn EntityExtractor>,
        events: EventBus,
        locks: Arc<KeyedLocks>,
        cfg: ResolverConfig,
        queue_max_attempts: i32,
    ) -> Self {
        Resolver {
            store,
            extractor,
            events,
            locks,
            cfg,
            queue_max_attempts,
        }
    }

    /// Resolve one message against the user's projects and persist the
    /// result atomically: mapping write, counter update and reflection
    /// enqueue land in one transaction, then UI events fire.
    pub async fn resolve(
        &self,
        user_id: &str,
        message: &ParsedMessage,
        entities: &ExtractedEntities,
    ) -> CoreResult<ResolveOutcome> {
        let thread_key = if message.thread_id.is_empty() {
            format!("{user_id}:{}", message.id)
        } else {
            format!("{user_id}:{}", message.thread_id)
        };
        let _guard = self.locks.lock(&thread_key).await;

        // Snapshot under a brief store lock; no I/O while held.
        let (projects, patterns, thread_mappings) = {
            let store = self.lock_store()?;
            let projects = store.list_matchable_projects(user_id)?;
            let patterns = store.active_patterns(user_id)?;
            let thread_mappings = if message.thread_id.is_empty() {
                Vec::new()
            } else {
                store.thread_mappings(user_id, &message.thread_id)?
            };
            (projects, patterns, thread_mappings)
        };

        let consensus = thread_consensus(&thread_mappings);
        let sender_projects = {
            let store = self.lock_store()?;
            store.projects_with_sender(user_id, &message.from.email)?
        };

        let mut candidates = score_candidates(
            &projects,
            &patterns,
            consensus.as_deref(),
            entities,
            &message.from.email,
            &sender_projects,
        );

        // The consensus project is always a candidate while its thread is,
        // even when extraction found nothing (a bare "thanks!" reply still
        // belongs to its thread's project).
        if let Some(consensus_id) = consensus.as_deref() {
            if !candidates.iter().any(|c| c.project.id == consensus_id) {
                if let Some(project) = projects.iter().find(|p| p.id == consensus_id) {
                    let matched = MatchedSignals {
                        thread: true,
                        ..MatchedSignals::default()
                    };
                    let score = score_for(&matched, entities.overall_confidence);
                    candidates.push(Candidate {
                        project: project.clone(),
                        matched,
                        score,
                    });
                    sort_candidates(&mut candidates);
                }
            }
        }

        // Similarity pass: only for the current front-runner, only when the
        // deterministic signals left it short of auto-assign, sampling at
        // most three recent messages of that project.
        if let Some(top) = candidates.first().cloned() {
            if top.score < self.cfg.auto && !top.matched.similarity {
                if self
                    .similarity_matches(user_id, &top.project.id, message)
                    .await?
                {
                    if let Some(c) = candidates.iter_mut().find(|c| c.project.id == top.project.id)
                    {
                        c.matched.similarity = true;
                        c.score = score_for(&c.matched, entities.overall_confidence);
                    }
                    sort_candidates(&mut candidates);
                }
            }
        }

        self.decide_and_persist(user_id, message, entities, candidates, consensus)
            .await
    }

    fn lock_store(&self) -> CoreResult<std::sync::MutexGuard<'_, Metastore>> {
        self.store
            .lock()
            .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))
    }

    async fn similarity_matches(
        &self,
        user_id: &str,
        project_id: &str,
        message: &ParsedMessage,
    ) -> CoreResult<bool> {
        let samples = {
            let store = self.lock_store()?;
            store.project_mappings(user_id, project_id, SIMILARITY_SAMPLES)?
        };
        if samples.is_empty() {
            return Ok(false);
        }

        let own = ExtractionInput {
            subject: message.subject.clone(),
            body: message.content().to_string(),
            sender_name: Some(message.from.name.clone()).filter(|n| !n.is_empty()),
            sender_email: message.from.email.clone(),
            existing_projects: Vec::new(),
        };
        for sample in &samples {
            let other = ExtractionInput {
                subject: sample.subject.clone().unwrap_or_default(),
                body: sample.snippet.clone().unwrap_or_default(),
                sender_name: sample.sender_name.clone(),
                sender_email: sample.sender_email.clone().unwrap_or_default(),
                existing_projects: Vec::new(),
            };
            match self.extractor.compare(&own, &other).await {
                Ok(verdict) if verdict.same_project && verdict.score >= 0.8 => return Ok(true),
                Ok(_) => {}
                // Similarity is the weakest signal; a failed comparison
                // degrades to "no signal" rather than failing resolution.
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    log::warn!("Resolver: similarity comparison failed: {e}");
                }
            }
        }
        Ok(false)
    }

    async fn decide_and_persist(
        &self,
        user_id: &str,
        message: &ParsedMessage,
        entities: &ExtractedEntities,
        candidates: Vec<Candidate>,
        consensus: Option<String>,
    ) -> CoreResult<ResolveOutcome> {
        let multi_project_names = multi_project_candidates(entities);
        let best = candidates.first();

        // Thread coupling: honour consensus unless the message's own signals
        // point at a different project at auto strength, in which case the
        // message splits away and the rest of the thread stays untouched.
        if let Some(consensus_id) = &consensus {
            let splitter = best
                .filter(|c| &c.project.id != consensus_id && c.score >= self.cfg.auto)
                .cloned();
            if let Some(split_to) = splitter {
                let outcome = self
                    .persist_assignment(
                        user_id,
                        message,
                        entities,
                        &split_to,
                        false,
                        true,
                    )
                    .await?;
                self.events.emit(UiEvent::SplitFromThread {
                    user_id: user_id.to_string(),
                    email_id: message.id.clone(),
                    thread_id: message.thread_id.clone(),
                    project_id: split_to.project.id.clone(),
                });
                return Ok(outcome);
            }
            if let Some(target) = candidates.iter().find(|c| &c.project.id == consensus_id) {
                let needs_review = target.score < self.cfg.auto;
                let target = target.clone();
                return self
                    .persist_assignment(user_id, message, entities, &target, needs_review, false)
                    .await;
            }
        }

        let best = match best {
            Some(c) => c.clone(),
            None => {
                return self.persist_creation(user_id, message, entities).await;
            }
        };

        if !multi_project_names.is_empty() {
            // The strongest still gets the mapping; duplication only happens
            // via explicit user action.
            self.events.emit(UiEvent::MultiProjectDetected {
                user_id: user_id.to_string(),
                email_id: message.id.clone(),
                project_ids: candidates
                    .iter()
                    .take(multi_project_names.len().max(2))
                    .map(|c| c.project.id.clone())
                    .collect(),
            });
        }

        if best.score >= self.cfg.auto {
            return self
                .persist_assignment(user_id, message, entities, &best, false, false)
                .await;
        }
        if best.score >= self.cfg.review {
            return self
                .persist_assignment(user_id, message, entities, &best, true, false)
                .await;
        }
        if best.score >= self.cfg.create {
            let peers: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| best.score - c.score <= TIE_WINDOW)
                .collect();
            if peers.len() >= 2 {
                if multi_project_names.is_empty() {
                    self.events.emit(UiEvent::MultiProjectDetected {
                        user_id: user_id.to_string(),
                        email_id: message.id.clone(),
                        project_ids: peers.iter().map(|c| c.project.id.clone()).collect(),
                    });
                }
                return Ok(ResolveOutcome {
                    project_id: None,
                    mapping_id: None,
                    created_project: false,
                    needs_review: true,
                    split_from_thread: false,
                    score: best.score,
                });
            }
            let outcome = self
                .persist_assignment(user_id, message, entities, &best, true, false)
                .await?;
            self.events.emit(UiEvent::LowConfidence {
                user_id: user_id.to_string(),
                email_id: message.id.clone(),
                project_id: best.project.id.clone(),
                score: best.score,
            });
            return Ok(outcome);
        }

        self.persist_creation(user_id, message, entities).await
    }

    async fn persist_assignment(
        &self,
        user_id: &str,
        message: &ParsedMessage,
        entities: &ExtractedEntities,
        candidate: &Candidate,
        needs_review: bool,
        split_from_thread: bool,
    ) -> CoreResult<ResolveOutcome> {
        let method = if candidate.matched.similarity
            && !candidate.matched.address
            && !candidate.matched.job_number
            && !candidate.matched.thread
            && !candidate.matched.name
        {
            AssociationMethod::Similarity
        } else {
            AssociationMethod::Auto
        };

        let mapping = new_mapping(
            user_id,
            &candidate.project.id,
            message,
            entities,
            candidate.score,
            method,
            needs_review,
            split_from_thread,
        );
        let job_numbers: Vec<String> = entities
            .job_numbers
            .iter()
            .map(|j| j.value.clone())
            .collect();
        let aliases: Vec<String> = entities
            .project_name
            .iter()
            .flat_map(|n| n.aliases.clone())
            .collect();

        let project_id = candidate.project.id.clone();
        let max_attempts = self.queue_max_attempts;
        let mapping_id = self.with_persistence_retry(|store| {
            store.with_transaction(|s| {
                let prior = s.get_active_mapping(user_id, &message.id)?;
                let mapping_id = s.assign_mapping(&mapping)?;
                if !job_numbers.is_empty() {
                    s.add_project_job_numbers(user_id, &project_id, &job_numbers)?;
                }
                if !aliases.is_empty() {
                    s.add_project_aliases(user_id, &project_id, &aliases)?;
                }
                s.set_attachment_project(user_id, &message.id, Some(&project_id))?;
                let mut previous_project_id = None;
                if let Some(prior) = &prior {
                    if prior.project_id != project_id {
                        s.recount_project(user_id, &prior.project_id)?;
                        previous_project_id = Some(prior.project_id.clone());
                    }
                }
                s.recount_project(user_id, &project_id)?;
                enqueue_reflection(
                    s,
                    &ReflectionTask {
                        user_id: user_id.to_string(),
                        mapping_id,
                        email_id: message.id.clone(),
                        thread_id: Some(message.thread_id.clone())
                            .filter(|t| !t.is_empty()),
                        project_id: project_id.clone(),
                        previous_project_id,
                        remove: false,
                    },
                    max_attempts,
                )?;
                Ok(mapping_id)
            })
        })?;

        log::info!(
            "Resolver: {} -> {} (score {:.2}, review {}, split {})",
            message.id,
            candidate.project.id,
            candidate.score,
            needs_review,
            split_from_thread
        );

        Ok(ResolveOutcome {
            project_id: Some(candidate.project.id.clone()),
            mapping_id: Some(mapping_id),
            created_project: false,
            needs_review,
            split_from_thread,
            score: candidate.score,
        })
    }

    async fn persist_creation(
        &self,
        user_id: &str,
        message: &ParsedMessage,
        entities: &ExtractedEntities,
    ) -> CoreResult<ResolveOutcome> {
        let project = seed_project(user_id, message, entities);
        let mapping_needs_review = entities.overall_confidence < self.cfg.auto;
        let mapping = new_mapping(
            user_id,
            &project.id,
            message,
            entities,
            entities.overall_confidence,
            AssociationMethod::Auto,
            mapping_needs_review,
            false,
        );

        let project_id = project.id.clone();
        let project_name = project.name.clone();
        let confidence = project.confidence;
        let max_attempts = self.queue_max_attempts;
        let mapping_id = self.with_persistence_retry(|store| {
            store.with_transaction(|s| {
                s.insert_project(&project)?;
                let mapping_id = s.assign_mapping(&mapping)?;
                s.set_attachment_project(user_id, &message.id, Some(&project_id))?;
                s.recount_project(user_id, &project_id)?;
                enqueue_reflection(
                    s,
                    &ReflectionTask {
                        user_id: user_id.to_string(),
                        mapping_id,
                        email_id: message.id.clone(),
                        thread_id: Some(message.thread_id.clone())
                            .filter(|t| !t.is_empty()),
                        project_id: project_id.clone(),
                        previous_project_id: None,
                        remove: false,
                    },
                    max_attempts,
                )?;
                Ok(mapping_id)
            })
        })?;

        log::info!(
            "Resolver: created project {} ({}) for {}",
            project_id,
            project_name,
            message.id
        );
        self.events.emit(UiEvent::NewProject {
            user_id: user_id.to_string(),
            project_id: project_id.clone(),
            name: project_name,
            confidence,
        });

        Ok(ResolveOutcome {
            project_id: Some(project_id),
            mapping_id: Some(mapping_id),
            created_project: true,
            needs_review: mapping_needs_review,
            split_from_thread: false,
            score: entities.overall_confidence,
        })
    }

    /// Retry the closure on constraint conflicts, a small bounded number of
    /// times, then surface `PersistenceConflict`.
    fn with_persistence_retry<T>(
        &self,
        f: impl Fn(&Metastore) -> Result<T, DbError>,
    ) -> CoreResult<T> {
        const MAX_TRIES: u32 = 3;
        let mut last = None;
        for _ in 0..MAX_TRIES {
            let store = self.lock_store()?;
            match f(&store) {
                Ok(value) => return Ok(value),
                Err(DbError::Sqlite(e)) if is_constraint_error(&e) => {
                    log::warn!("Resolver: constraint conflict, retrying: {e}");
                    last = Some(e.to_string());
                }
                Err(other) => return Err(CoreError::Db(other)),
            }
        }
        Err(CoreError::PersistenceConflict(
            last.unwrap_or_else(|| "retries exhausted".into()),
        ))
    }
}

fn is_constraint_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// The single project every mapping of the thread points to, if any.
pub fn thread_consensus(thread_mappings: &[DbMapping]) -> Option<String> {
    let mut ids = thread_mappings.iter().map(|m| m.project_id.as_str());
    let first = ids.next()?;
    if ids.all(|id| id == first) {
        Some(first.to_string())
    } else {
        None
    }
}

/// Name candidates strong enough to count as independent projects.
pub fn multi_project_candidates(entities: &ExtractedEntities) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    if let Some(primary) = &entities.project_name {
        if primary.confidence >= MULTI_PROJECT_NAME_CONFIDENCE {
            names.push(primary.value.as_str());
        }
    }
    for alt in &entities.alternative_names {
        if alt.confidence >= MULTI_PROJECT_NAME_CONFIDENCE {
            names.push(alt.value.as_str());
        }
    }
    if names.len() >= 2 {
        names
    } else {
        Vec::new()
    }
}

/// Score every project against the extraction. Sender identity contributes
/// only through the client signal; a brand-new sender can still match on
/// address, job number, thread or name.
pub fn score_candidates(
    projects: &[DbProject],
    patterns: &[DbPattern],
    consensus: Option<&str>,
    entities: &ExtractedEntities,
    sender_email: &str,
    sender_projects: &HashSet<String>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = projects
        .iter()
        .map(|project| {
            let mut matched = MatchedSignals::default();

            matched.address = address_matches(project, entities);
            matched.job_number = entities.job_numbers.iter().any(|job| {
                project
                    .job_numbers
                    .iter()
                    .any(|pj| job_numbers_match(pj, &job.value))
            });
            matched.thread = consensus == Some(project.id.as_str());
            matched.name = name_matches(project, entities, patterns);
            matched.client = client_matches(project, entities, sender_email, sender_projects);
            matched.pattern_bonus = pattern_bonus(project, patterns, entities, sender_email);

            let score = score_for(&matched, entities.overall_confidence);
            Candidate {
                project: project.clone(),
                matched,
                score,
            }
        })
        .filter(|c| c.score > 0.0)
        .collect();

    sort_candidates(&mut candidates);
    candidates
}

/// Weighted sum × confidence, with decisive-signal floors, clamped to [0,1].
/// Adding a matched signal never lowers the result.
pub fn score_for(matched: &MatchedSignals, overall_confidence: f64) -> f64 {
    let mut sum = 0.0;
    if matched.address {
        sum += WEIGHT_ADDRESS;
    }
    if matched.job_number {
        sum += WEIGHT_JOB_NUMBER;
    }
    if matched.thread {
        sum += WEIGHT_THREAD;
    }
    if matched.name {
        sum += WEIGHT_NAME;
    }
    if matched.client {
        sum += WEIGHT_CLIENT;
    }
    if matched.similarity {
        sum += WEIGHT_SIMILARITY;
    }
    sum += matched.pattern_bonus;

    let mut score = sum * overall_confidence;
    if matched.address {
        score = score.max(FLOOR_ADDRESS * overall_confidence);
    }
    if matched.job_number {
        score = score.max(FLOOR_JOB_NUMBER * overall_confidence);
    }
    score.clamp(0.0, 1.0)
}

/// Deterministic order: score desc, then most recent `last_email_at`, then
/// lexicographically smaller project id.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.project.last_email_at.cmp(&a.project.last_email_at))
            .then_with(|| a.project.id.cmp(&b.project.id))
    });
}

/// Street + postcode, or street + locality; full-address equality as a
/// fallback when structured fields are missing.
fn address_matches(project: &DbProject, entities: &ExtractedEntities) -> bool {
    let extracted = match &entities.address {
        Some(addr) => addr,
        None => return false,
    };

    if let (Some(ps), Some(es)) = (&project.address.street, &extracted.street) {
        if normalize_street(ps) == normalize_street(es) {
            if let (Some(pp), Some(ep)) = (&project.address.postcode, &extracted.postcode) {
                if normalize_postcode(pp) == normalize_postcode(ep) {
                    return true;
                }
            }
            if let (Some(pl), Some(el)) = (&project.address.locality, &extracted.locality) {
                if normalize_name(pl) == normalize_name(el) {
                    return true;
                }
            }
        }
    }

    if let (Some(pf), Some(ef)) = (&project.address.full, &extracted.full) {
        if normalize_name(pf) == normalize_name(ef) {
            return true;
        }
    }
    false
}

/// Name or alias equality after folding; an alias pattern for this project
/// promotes a partial (substring) match to a full name signal.
fn name_matches(project: &DbProject, entities: &ExtractedEntities, patterns: &[DbPattern]) -> bool {
    let extracted_names: Vec<String> = entities
        .project_name
        .iter()
        .chain(entities.alternative_names.iter())
        .flat_map(|n| std::iter::once(n.value.as_str()).chain(n.aliases.iter().map(|a| a.as_str())))
        .map(normalize_name)
        .filter(|n| !n.is_empty())
        .collect();
    if extracted_names.is_empty() {
        return false;
    }

    let mut project_names: Vec<String> = vec![normalize_name(&project.name)];
    project_names.extend(project.aliases.iter().map(|a| normalize_name(a)));

    for extracted in &extracted_names {
        if project_names.iter().any(|pn| pn == extracted) {
            return true;
        }
    }

    // Alias patterns learned from corrections: partial match suffices. The
    // stored key is a digest, so matching uses the raw value from the body.
    for pattern in patterns {
        if pattern.kind == PatternKind::Alias && pattern.project_id() == Some(project.id.as_str()) {
            if let Some(alias) = pattern.matched_value() {
                for extracted in &extracted_names {
                    if extracted.contains(alias) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn client_matches(
    project: &DbProject,
    entities: &ExtractedEntities,
    sender_email: &str,
    sender_projects: &HashSet<String>,
) -> bool {
    let mut emails: Vec<String> = Vec::new();
    if !sender_email.is_empty() {
        emails.push(sender_email.to_lowercase());
    }
    if let Some(client) = &entities.client {
        if let Some(email) = &client.email {
            emails.push(email.to_lowercase());
        }
    }
    if emails.is_empty() {
        return false;
    }

    if let Some(project_client) = &project.client.email {
        let folded = project_client.to_lowercase();
        if emails.iter().any(|e| *e == folded) {
            return true;
        }
    }
    sender_projects.contains(&project.id)
}

/// Sender and address patterns add a fixed bonus to their project's score.
/// Pattern keys are digests, so lookup means hashing the message's own
/// values and comparing.
fn pattern_bonus(
    project: &DbProject,
    patterns: &[DbPattern],
    entities: &ExtractedEntities,
    sender_email: &str,
) -> f64 {
    let sender_key = if sender_email.is_empty() {
        None
    } else {
        Some(learned_key(sender_email))
    };
    let address_key = entities.address.as_ref().and_then(|addr| {
        addr.street
            .as_ref()
            .map(|street| learned_key(&address_pattern_key(street, addr.postcode.as_deref())))
    });

    let mut bonus: f64 = 0.0;
    for pattern in patterns {
        if pattern.project_id() != Some(project.id.as_str()) {
            continue;
        }
        match pattern.kind {
            PatternKind::Sender => {
                if sender_key.as_deref() == Some(pattern.pattern_key.as_str()) {
                    bonus = bonus.max(PATTERN_BONUS);
                }
            }
            PatternKind::Address => {
                if address_key.as_deref() == Some(pattern.pattern_key.as_str()) {
                    bonus = bonus.max(PATTERN_BONUS);
                }
            }
            PatternKind::Alias => {}
        }
    }
    bonus
}

// ---------------------------------------------------------------------------
// Seeding and mapping construction
// ---------------------------------------------------------------------------

fn new_mapping(
    user_id: &str,
    project_id: &str,
    message: &ParsedMessage,
    entities: &ExtractedEntities,
    confidence: f64,
    method: AssociationMethod,
    needs_review: bool,
    split_from_thread: bool,
) -> NewMapping {
    NewMapping {
        user_id: user_id.to_string(),
        project_id: project_id.to_string(),
        email_id: message.id.clone(),
        thread_id: Some(message.thread_id.clone()).filter(|t| !t.is_empty()),
        confidence,
        association_method: Some(method),
        needs_review,
        split_from_thread,
        subject: Some(message.subject.clone()).filter(|s| !s.is_empty()),
        sender_email: Some(message.from.email.clone()).filter(|e| !e.is_empty()),
        sender_name: Some(message.from.name.clone()).filter(|n| !n.is_empty()),
        snippet: Some(message.snippet.clone()).filter(|s| !s.is_empty()),
        message_date: message.date.map(|d| d.to_rfc3339()),
        street: entities.address.as_ref().and_then(|a| a.street.clone()),
        postcode: entities.address.as_ref().and_then(|a| a.postcode.clone()),
    }
}

/// Seed a new project from the extraction, falling back from name to
/// address to subject so it always has something displayable.
pub fn seed_project(
    user_id: &str,
    message: &ParsedMessage,
    entities: &ExtractedEntities,
) -> DbProject {
    let name = entities
        .project_name
        .as_ref()
        .map(|n| n.value.clone())
        .or_else(|| {
            entities
                .address
                .as_ref()
                .and_then(|a| a.full.clone().or_else(|| a.street.clone()))
        })
        .unwrap_or_else(|| {
            if message.subject.is_empty() {
                format!("Mail from {}", message.from.email)
            } else {
                message.subject.clone()
            }
        });

    let address = entities
        .address
        .as_ref()
        .map(|a| ProjectAddress {
            full: a.full.clone(),
            street: a.street.clone(),
            locality: a.locality.clone(),
            region: a.region.clone(),
            postcode: a.postcode.clone(),
        })
        .unwrap_or_default();

    let client = entities
        .client
        .as_ref()
        .map(|c| ProjectClient {
            name: c.name.clone(),
            email: c.email.clone(),
            phone: c.phone.clone(),
            company: c.company.clone(),
        })
        .unwrap_or_else(|| ProjectClient {
            name: Some(message.from.name.clone()).filter(|n| !n.is_empty()),
            email: Some(message.from.email.clone()).filter(|e| !e.is_empty()),
            phone: None,
            company: None,
        });

    DbProject {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name,
        aliases: entities
            .project_name
            .iter()
            .flat_map(|n| n.aliases.clone())
            .collect(),
        address,
        client,
        project_type: entities.project_type.clone(),
        job_numbers: entities.job_numbers.iter().map(|j| j.value.clone()).collect(),
        status: ProjectStatus::Active,
        email_count: 0,
        last_email_at: None,
        created_from_email_id: Some(message.id.clone()),
        confidence: entities.overall_confidence,
        needs_review: entities.overall_confidence < 0.60,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

// ---------------------------------------------------------------------------
// Metastore extension used only by the resolver
// ---------------------------------------------------------------------------

impl Metastore {
    /// Project ids where this sender already appears on an active mapping.
    pub fn projects_with_sender(
        &self,
        user_id: &str,
        sender_email: &str,
    ) -> Result<HashSet<String>, DbError> {
        if sender_email.is_empty() {
            return Ok(HashSet::new());
        }
        let mut stmt = self.conn_ref().prepare(
            "SELECT DISTINCT project_id FROM email_project_mappings
             WHERE user_id = ?1 AND is_active = 1 AND LOWER(sender_email) = LOWER(?2)",
        )?;
        let rows = stmt.query_map(params![user_id, sender_email], |row| row.get(0))?;
        rows.collect::<Result<HashSet<String>, _>>()
            .map_err(DbError::from)
    }
}
