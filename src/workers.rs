//! Queue drainers.
//!
//! Three worker kinds, one per queue. A worker reserves a small batch under
//! a lease, does the slow work without holding the store lock, then
//! completes or fails each item with a classified error. Every failure path
//! goes through the taxonomy: transient → retry with backoff, rate limit →
//! deferred visibility by the reported delay, auth → pause the user and
//! release their in-flight work, everything else → dead letter.

use std::sync::Arc;
use std::time::Duration;

use crate::attachments::{categorize_file, FilenameParser};
use crate::categorize::categorize;
use crate::db::{
    DbQueueItem, DbUser, NewAttachment, QUEUE_AI, QUEUE_NOTIFICATION, QUEUE_REFLECT,
    PRIORITY_BULK, PRIORITY_DEFAULT, PRIORITY_RETRO,
};
use crate::error::{CoreError, CoreResult};
use crate::events::UiEvent;
use crate::extractor::{ExtractionInput, JobNumber};
use crate::gmail::parser::parse_message;
use crate::gmail::{CredSession, ParsedMessage};
use crate::labels::label_name_for;
use crate::queue::{
    enqueue_message_event, enqueue_processing_task, EventSource, MessageEvent, ProcessingTask,
    ReflectionTask,
};
use crate::state::AppState;
use crate::watch::creds_from_user;

/// Reservation lease. Long enough for a fetch+extract round trip.
const LEASE: Duration = Duration::from_secs(120);

/// AI queue depth above which the notification workers slow their handoff.
const AI_HIGH_WATERMARK: i64 = 500;

/// Deferral applied when backpressure or a paused user blocks an item.
const DEFER_BACKPRESSURE: Duration = Duration::from_secs(60);
const DEFER_PAUSED_USER: Duration = Duration::from_secs(600);

/// Drain one batch from the notification queue: fetch + parse messages,
/// store attachment descriptors, categorize, and hand off to the AI queue.
/// Returns the number of items completed.
pub async fn drain_notification_queue(
    state: &Arc<AppState>,
    worker: &str,
    batch: usize,
) -> CoreResult<usize> {
    let items = {
        let store = lock_store(state)?;
        store.reserve_items(QUEUE_NOTIFICATION, worker, batch, LEASE)?
    };

    let mut completed = 0;
    for item in items {
        match process_notification_item(state, &item).await {
            Ok(()) => {
                let store = lock_store(state)?;
                store.complete_item(item.id)?;
                completed += 1;
            }
            Err(e) => handle_item_failure(state, &item, e).await?,
        }
    }
    Ok(completed)
}

async fn process_notification_item(state: &Arc<AppState>, item: &DbQueueItem) -> CoreResult<()> {
    let event: MessageEvent = serde_json::from_str(&item.payload)
        .map_err(|e| CoreError::Invalid(format!("bad event payload: {e}")))?;

    let user = workable_user(state, &event.user_id)?;

    match &event.message_id {
        // Opaque push event: enumerate history ourselves.
        None => {
            let cursor = {
                let store = lock_store(state)?;
                store.get_watch(&user.id)?.and_then(|w| w.history_cursor)
            };
            let cursor = match cursor {
                Some(c) => c,
                None => {
                    state.watch.ensure_watch(&user).await?;
                    return Ok(());
                }
            };
            let mut creds = creds_from_user(&user, &state.config)?;
            let page = state.gmail.get_history(&mut creds, &cursor, 10).await?;
            {
                let store = lock_store(state)?;
                for message in &page.messages {
                    enqueue_message_event(
                        &store,
                        &MessageEvent {
                            user_id: user.id.clone(),
                            message_id: Some(message.id.clone()),
                            thread_id: Some(message.thread_id.clone()).filter(|t| !t.is_empty()),
                            history_cursor: Some(message.cursor.clone()).filter(|c| !c.is_empty()),
                            source: EventSource::Push,
                        },
                        PRIORITY_DEFAULT,
                        state.config.queue_max_attempts,
                    )?;
                }
                if let Some(latest) = &page.latest_cursor {
                    store.set_watch_cursor(&user.id, latest)?;
                }
            }
            persist_creds(state, &creds)?;
            Ok(())
        }

        Some(message_id) => {
            // Backpressure: when the AI queue is deep, defer instead of
            // piling more work on.
            let depth = {
                let store = lock_store(state)?;
                store.queue_depth(QUEUE_AI)?
            };
            if depth > AI_HIGH_WATERMARK {
                return Err(CoreError::RateLimited {
                    retry_after: DEFER_BACKPRESSURE,
                });
            }

            let mut creds = creds_from_user(&user, &state.config)?;
            let detail = state.gmail.fetch_message(&mut creds, message_id, true).await?;
            persist_creds(state, &creds)?;
            let message = parse_message(&detail);

            store_attachments(state, &user.id, &message)?;

            let classification = categorize(&message);
            let priority = if classification.is_bulk {
                PRIORITY_BULK
            } else if classification.requires_action {
                PRIORITY_DEFAULT - 2
            } else if event.source == EventSource::Retro {
                PRIORITY_RETRO
            } else {
                PRIORITY_DEFAULT
            };
            log::debug!(
                "Ingest: {} categorized {} (bulk {}) priority {}",
                message.id,
                classification.category.as_str(),
                classification.is_bulk,
                priority
            );

            let store = lock_store(state)?;
            enqueue_processing_task(
                &store,
                &ProcessingTask::Extract {
                    user_id: user.id.clone(),
                    message_id: message.id.clone(),
                    thread_id: Some(message.thread_id.clone()).filter(|t| !t.is_empty()),
                },
                priority,
                state.config.queue_max_attempts,
            )?;
            Ok(())
        }
    }
}

/// Drain one batch from the AI queue: extraction + resolution, batch
/// re-grouping, and retroactive scan slices.
pub async fn drain_ai_queue(
    state: &Arc<AppState>,
    worker: &str,
    batch: usize,
) -> CoreResult<usize> {
    let items = {
        let store = lock_store(state)?;
        store.reserve_items(QUEUE_AI, worker, batch, LEASE)?
    };

    let mut completed = 0;
    for item in items {
        match process_ai_item(state, &item).await {
            Ok(()) => {
                let store = lock_store(state)?;
                store.complete_item(item.id)?;
                completed += 1;
            }
            Err(e) => handle_item_failure(state, &item, e).await?,
        }
    }
    Ok(completed)
}

async fn process_ai_item(state: &Arc<AppState>, item: &DbQueueItem) -> CoreResult<()> {
    let task: ProcessingTask = serde_json::from_str(&item.payload)
        .map_err(|e| CoreError::Invalid(format!("bad task payload: {e}")))?;

    match task {
        ProcessingTask::Extract {
            user_id,
            message_id,
            ..
        } => {
            let user = workable_user(state, &user_id)?;
            let mut creds = creds_from_user(&user, &state.config)?;
            let detail = state
                .gmail
                .fetch_message(&mut creds, &message_id, true)
                .await?;
            persist_creds(state, &creds)?;
            let message = parse_message(&detail);

            extract_and_resolve(state, &user_id, &message).await?;
            Ok(())
        }

        ProcessingTask::GroupBatch {
            user_id,
            message_ids,
        } => {
            let store = lock_store(state)?;
            for message_id in message_ids {
                enqueue_processing_task(
                    &store,
                    &ProcessingTask::Extract {
                        user_id: user_id.clone(),
                        message_id,
                        thread_id: None,
                    },
                    PRIORITY_DEFAULT,
                    state.config.queue_max_attempts,
                )?;
            }
            Ok(())
        }

        ProcessingTask::RetroactiveScanSlice {
            user_id,
            after,
            before,
            page_token,
        } => {
            let user = workable_user(state, &user_id)?;
            let mut creds = creds_from_user(&user, &state.config)?;
            let query = format!("after:{after} before:{before}");
            let list = state
                .gmail
                .list_messages(
                    &mut creds,
                    &query,
                    page_token.as_deref(),
                    state.config.batch_max as u32,
                )
                .await?;
            persist_creds(state, &creds)?;

            let store = lock_store(state)?;
            for stub in &list.messages {
                enqueue_message_event(
                    &store,
                    &MessageEvent {
                        user_id: user_id.clone(),
                        message_id: Some(stub.id.clone()),
                        thread_id: Some(stub.thread_id.clone()).filter(|t| !t.is_empty()),
                        history_cursor: None,
                        source: EventSource::Retro,
                    },
                    PRIORITY_RETRO,
                    state.config.queue_max_attempts,
                )?;
            }
            if let Some(next) = list.next_page_token {
                enqueue_processing_task(
                    &store,
                    &ProcessingTask::RetroactiveScanSlice {
                        user_id,
                        after,
                        before,
                        page_token: Some(next),
                    },
                    PRIORITY_RETRO,
                    state.config.queue_max_attempts,
                )?;
            }
            Ok(())
        }
    }
}

/// Extraction + resolution for one parsed message. Attachment-filename job
/// numbers join the extraction before scoring.
pub async fn extract_and_resolve(
    state: &Arc<AppState>,
    user_id: &str,
    message: &ParsedMessage,
) -> CoreResult<crate::resolver::ResolveOutcome> {
    let existing_projects: Vec<String> = {
        let store = lock_store(state)?;
        store
            .list_matchable_projects(user_id)?
            .into_iter()
            .map(|p| p.name)
            .collect()
    };

    let input = ExtractionInput {
        subject: message.subject.clone(),
        body: message.content().to_string(),
        sender_name: Some(message.from.name.clone()).filter(|n| !n.is_empty()),
        sender_email: message.from.email.clone(),
        existing_projects,
    };
    let mut entities = state.extractor.extract(&input).await?;

    let parser = FilenameParser::new();
    for job in parser.job_numbers_in(&message.attachments) {
        if !entities
            .job_numbers
            .iter()
            .any(|existing| crate::normalize::job_numbers_match(&existing.value, &job))
        {
            entities.job_numbers.push(JobNumber {
                value: job,
                source: "attachment-filename".into(),
                confidence: 0.7,
            });
        }
    }

    state.resolver.resolve(user_id, message, &entities).await
}

/// Drain one batch from the reflect queue: apply or remove project labels.
pub async fn drain_reflect_queue(
    state: &Arc<AppState>,
    worker: &str,
    batch: usize,
) -> CoreResult<usize> {
    let items = {
        let store = lock_store(state)?;
        store.reserve_items(QUEUE_REFLECT, worker, batch, LEASE)?
    };

    let mut completed = 0;
    for item in items {
        match process_reflect_item(state, &item).await {
            Ok(()) => {
                let store = lock_store(state)?;
                store.complete_item(item.id)?;
                completed += 1;
            }
            Err(e) => {
                // Persistent label failures park the mapping for the
                // reconciliation pass rather than losing the intent.
                if !e.is_retryable() {
                    if let Ok(task) = serde_json::from_str::<ReflectionTask>(&item.payload) {
                        let _ = state.reflector.mark_pending(task.mapping_id);
                    }
                }
                handle_item_failure(state, &item, e).await?;
            }
        }
    }
    Ok(completed)
}

async fn process_reflect_item(state: &Arc<AppState>, item: &DbQueueItem) -> CoreResult<()> {
    let task: ReflectionTask = serde_json::from_str(&item.payload)
        .map_err(|e| CoreError::Invalid(format!("bad reflection payload: {e}")))?;

    let user = workable_user(state, &task.user_id)?;
    let mut creds = creds_from_user(&user, &state.config)?;

    if task.remove {
        let project_name = {
            let store = lock_store(state)?;
            store
                .get_project(&task.user_id, &task.project_id)?
                .map(|p| p.name)
        };
        if let Some(name) = project_name {
            let label_name = label_name_for(&name);
            if let Ok(label_id) = state.reflector.ensure_label(&mut creds, &label_name).await {
                state
                    .reflector
                    .remove(&mut creds, &task.email_id, &label_id, &label_name)
                    .await?;
            }
        }
    } else {
        state.reflector.reflect(&mut creds, &task).await?;
    }
    persist_creds(state, &creds)?;
    Ok(())
}

/// Reconciliation: re-enqueue reflection for mappings stuck pending.
pub fn reconcile_pending_reflections(state: &Arc<AppState>, user_id: &str) -> CoreResult<usize> {
    let store = lock_store(state)?;
    let pending = store.list_reflection_pending(user_id)?;
    let mut queued = 0;
    for mapping in pending {
        crate::queue::enqueue_reflection(
            &store,
            &ReflectionTask {
                user_id: user_id.to_string(),
                mapping_id: mapping.id,
                email_id: mapping.email_id.clone(),
                thread_id: mapping.thread_id.clone(),
                project_id: mapping.project_id.clone(),
                previous_project_id: None,
                remove: false,
            },
            state.config.queue_max_attempts,
        )?;
        queued += 1;
    }
    Ok(queued)
}

// ---------------------------------------------------------------------------
// Shared failure handling
// ---------------------------------------------------------------------------

async fn handle_item_failure(
    state: &Arc<AppState>,
    item: &DbQueueItem,
    error: CoreError,
) -> CoreResult<()> {
    if error.requires_user_action() {
        log::warn!(
            "Worker: auth expired for {} while processing item {}",
            item.user_id,
            item.id
        );
        let store = lock_store(state)?;
        store.set_user_auth_expired(&item.user_id, true)?;
        // Release every in-flight item of this user so nothing is consumed
        // while their workers are paused.
        store.release_user_leases(&item.user_id, QUEUE_NOTIFICATION)?;
        store.release_user_leases(&item.user_id, QUEUE_AI)?;
        store.release_user_leases(&item.user_id, QUEUE_REFLECT)?;
        drop(store);
        state.events.emit(UiEvent::AuthExpired {
            user_id: item.user_id.clone(),
        });
        return Ok(());
    }

    let retryable = error.is_retryable();
    let delay = error.retry_after();
    log::warn!(
        "Worker: item {} failed ({}retryable): {}",
        item.id,
        if retryable { "" } else { "non-" },
        error
    );
    let store = lock_store(state)?;
    store.fail_item(item.id, &error.to_string(), retryable, delay)?;
    Ok(())
}

fn workable_user(state: &Arc<AppState>, user_id: &str) -> CoreResult<DbUser> {
    let store = lock_store(state)?;
    let user = store
        .get_user(user_id)?
        .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))?;
    if !user.is_active {
        return Err(CoreError::Invalid(format!("user {user_id} is inactive")));
    }
    if user.auth_expired {
        // Paused until re-consent; keep the item around without burning it.
        return Err(CoreError::RateLimited {
            retry_after: DEFER_PAUSED_USER,
        });
    }
    Ok(user)
}

fn persist_creds(state: &Arc<AppState>, creds: &CredSession) -> CoreResult<()> {
    if creds.refreshed {
        let store = lock_store(state)?;
        store.set_user_tokens(&creds.user_id, &creds.access_token, creds.expiry.as_deref())?;
    }
    Ok(())
}

fn store_attachments(
    state: &Arc<AppState>,
    user_id: &str,
    message: &ParsedMessage,
) -> CoreResult<()> {
    if message.attachments.is_empty() {
        return Ok(());
    }
    let parser = FilenameParser::new();
    let store = lock_store(state)?;
    for att in &message.attachments {
        let indicators = parser.parse(&att.filename);
        store.insert_attachment(&NewAttachment {
            user_id: user_id.to_string(),
            email_id: message.id.clone(),
            thread_id: Some(message.thread_id.clone()).filter(|t| !t.is_empty()),
            attachment_id: att.attachment_id.clone(),
            filename: att.filename.clone(),
            mime_type: Some(att.mime_type.clone()).filter(|m| !m.is_empty()),
            size: att.size,
            category: categorize_file(&att.mime_type, &att.filename)
                .as_str()
                .to_string(),
            indicators: serde_json::to_value(&indicators).unwrap_or(serde_json::Value::Null),
        })?;
    }
    Ok(())
}

fn lock_store(
    state: &Arc<AppState>,
) -> CoreResult<std::sync::MutexGuard<'_, crate::db::Metastore>> {
    state
        .store
        .lock()
        .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))
}

/// Release every lease held by this worker (graceful shutdown).
pub fn release_worker(state: &Arc<AppState>, worker: &str) -> CoreResult<usize> {
    let store = lock_store(state)?;
    let released = store.release_worker_leases(worker)?;
    if released > 0 {
        log::info!("Worker {worker}: released {released} in-flight items");
    }
    Ok(released)
}
