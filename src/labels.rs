//! Label reflection: propagate mappings back to the provider.
//!
//! Labels are named `Project: <name>`. `ensure_label` is find-or-create
//! with case-insensitive matching so it never mints duplicates, apply is
//! idempotent (the provider treats a re-add as a no-op), and system labels
//! are refused for removal. Reflection is eventually consistent: a mapping
//! write may be visible before its label lands; persistent failures set
//! `reflection_pending` and a reconciliation pass retries them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::SharedStore;
use crate::error::{CoreError, CoreResult};
use crate::gmail::client::Label;
use crate::gmail::{CredSession, GmailClient};
use crate::queue::ReflectionTask;

const LABEL_PREFIX: &str = "Project: ";

const SYSTEM_LABELS: &[&str] = &[
    "INBOX", "SENT", "DRAFT", "SPAM", "TRASH", "UNREAD", "STARRED", "IMPORTANT", "CHAT",
];

pub fn label_name_for(project_name: &str) -> String {
    format!("{LABEL_PREFIX}{project_name}")
}

pub fn is_system_label(name: &str) -> bool {
    SYSTEM_LABELS.contains(&name.to_uppercase().as_str())
        || name.to_uppercase().starts_with("CATEGORY_")
}

/// Case-insensitive lookup in a label listing.
pub fn find_label_id(labels: &[Label], name: &str) -> Option<String> {
    labels
        .iter()
        .find(|l| l.name.eq_ignore_ascii_case(name))
        .map(|l| l.id.clone())
}

pub struct LabelReflector {
    gmail: Arc<GmailClient>,
    store: SharedStore,
    /// user_id:folded-name -> label id. Invalidated only by process restart;
    /// a stale entry is harmless because apply is idempotent and a deleted
    /// label surfaces as a provider 404 handled by the retry path.
    cache: Mutex<HashMap<String, String>>,
}

impl LabelReflector {
    pub fn new(gmail: Arc<GmailClient>, store: SharedStore) -> Self {
        LabelReflector {
            gmail,
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(user_id: &str, name: &str) -> String {
        format!("{user_id}:{}", name.to_lowercase())
    }

    /// Find or create the label, never duplicating on case differences.
    pub async fn ensure_label(
        &self,
        creds: &mut CredSession,
        name: &str,
    ) -> CoreResult<String> {
        let key = Self::cache_key(&creds.user_id, name);
        if let Some(id) = self.cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(id);
        }

        let labels = self.gmail.list_labels(creds).await?;
        let id = match find_label_id(&labels, name) {
            Some(id) => id,
            None => self.gmail.create_label(creds, name).await?.id,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, id.clone());
        }
        Ok(id)
    }

    /// Look up a label id without creating it.
    async fn lookup_label(
        &self,
        creds: &mut CredSession,
        name: &str,
    ) -> CoreResult<Option<String>> {
        let key = Self::cache_key(&creds.user_id, name);
        if let Some(id) = self.cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(Some(id));
        }
        let labels = self.gmail.list_labels(creds).await?;
        Ok(find_label_id(&labels, name))
    }

    pub async fn apply(
        &self,
        creds: &mut CredSession,
        message_id: &str,
        label_id: &str,
    ) -> CoreResult<()> {
        self.gmail
            .modify_message(creds, message_id, &[label_id.to_string()], &[])
            .await
    }

    pub async fn remove(
        &self,
        creds: &mut CredSession,
        message_id: &str,
        label_id: &str,
        label_name: &str,
    ) -> CoreResult<()> {
        if is_system_label(label_name) {
            return Err(CoreError::Invalid(format!(
                "refusing to remove system label {label_name}"
            )));
        }
        self.gmail
            .modify_message(creds, message_id, &[], &[label_id.to_string()])
            .await
    }

    /// Apply one project label to many messages (thread grouping, merges).
    pub async fn apply_batch(
        &self,
        creds: &mut CredSession,
        message_ids: &[String],
        label_id: &str,
        batch_max: usize,
    ) -> CoreResult<usize> {
        let mut applied = 0;
        for chunk in message_ids.chunks(batch_max.max(1)) {
            applied += self
                .gmail
                .batch_modify(creds, chunk, &[label_id.to_string()], &[])
                .await?;
        }
        Ok(applied)
    }

    /// Label every mapped message of a thread.
    pub async fn apply_thread(
        &self,
        creds: &mut CredSession,
        thread_id: &str,
        label_id: &str,
        batch_max: usize,
    ) -> CoreResult<usize> {
        let message_ids: Vec<String> = {
            let store = self
                .store
                .lock()
                .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))?;
            store
                .thread_mappings(&creds.user_id, thread_id)?
                .into_iter()
                .map(|m| m.email_id)
                .collect()
        };
        if message_ids.is_empty() {
            return Ok(0);
        }
        self.apply_batch(creds, &message_ids, label_id, batch_max).await
    }

    /// Execute one reflection task: ensure the project label, swap the old
    /// project's label off when the message moved, clear the pending flag.
    pub async fn reflect(&self, creds: &mut CredSession, task: &ReflectionTask) -> CoreResult<()> {
        let (project_name, previous_name) = {
            let store = self
                .store
                .lock()
                .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))?;
            let project = store.get_project(&task.user_id, &task.project_id)?;
            let previous = match &task.previous_project_id {
                Some(prev) => store.get_project(&task.user_id, prev)?,
                None => None,
            };
            (project.map(|p| p.name), previous.map(|p| p.name))
        };

        let project_name = match project_name {
            Some(name) => name,
            // Project vanished between enqueue and drain (merge races are
            // reconciled by the correction path); nothing left to reflect.
            None => {
                self.clear_pending(task.mapping_id)?;
                return Ok(());
            }
        };

        let label_id = self.ensure_label(creds, &label_name_for(&project_name)).await?;

        let mut remove = Vec::new();
        if let Some(prev_name) = previous_name {
            if let Some(prev_id) = self
                .lookup_label(creds, &label_name_for(&prev_name))
                .await?
            {
                remove.push(prev_id);
            }
        }

        self.gmail
            .modify_message(creds, &task.email_id, &[label_id], &remove)
            .await?;
        self.clear_pending(task.mapping_id)?;
        log::debug!(
            "Labels: reflected {} -> {}",
            task.email_id,
            project_name
        );
        Ok(())
    }

    /// Mark a mapping as awaiting reconciliation after a failed reflection.
    pub fn mark_pending(&self, mapping_id: i64) -> CoreResult<()> {
        let store = self
            .store
            .lock()
            .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))?;
        store.set_reflection_pending(mapping_id, true)?;
        Ok(())
    }

    fn clear_pending(&self, mapping_id: i64) -> CoreResult<()> {
        let store = self
            .store
            .lock()
            .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))?;
        store.set_reflection_pending(mapping_id, false)?;
        Ok(())
    }
}
