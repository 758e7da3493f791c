//! Watch coordination: push subscriptions with a polling fallback.
//!
//! One subscription per user. When a Pub/Sub topic is configured the
//! provider pushes change notifications; the envelope is never trusted to
//! enumerate messages; a push only tells us to re-read history from the
//! last acknowledged cursor. Without a topic, a polling loop reads history
//! on a cadence. Either way, events for one user enter the notification
//! queue in cursor order; duplicate suppression is the queue's dedup key.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::Config;
use crate::db::{DbUser, SharedStore, WatchKind, PRIORITY_DEFAULT, PRIORITY_TOP};
use crate::error::{CoreError, CoreResult};
use crate::gmail::{CredSession, GmailClient};
use crate::queue::{enqueue_message_event, EventSource, MessageEvent};

/// History pages followed per poll; deep backlogs continue next tick.
const HISTORY_PAGES_PER_POLL: usize = 10;

/// Build a credential session from a stored user row.
pub fn creds_from_user(user: &DbUser, config: &Config) -> CoreResult<CredSession> {
    let access_token = user
        .access_token
        .clone()
        .ok_or(CoreError::AuthExpired)?;
    Ok(CredSession {
        user_id: user.id.clone(),
        access_token,
        refresh_token: user.refresh_token.clone(),
        expiry: user.token_expiry.clone(),
        client_id: config.google_client_id.clone(),
        client_secret: config.google_client_secret.clone(),
        refreshed: false,
    })
}

pub struct WatchCoordinator {
    store: SharedStore,
    gmail: Arc<GmailClient>,
    config: Arc<Config>,
}

impl WatchCoordinator {
    pub fn new(store: SharedStore, gmail: Arc<GmailClient>, config: Arc<Config>) -> Self {
        WatchCoordinator {
            store,
            gmail,
            config,
        }
    }

    fn lock_store(&self) -> CoreResult<std::sync::MutexGuard<'_, crate::db::Metastore>> {
        self.store
            .lock()
            .map_err(|_| CoreError::PersistenceConflict("store lock poisoned".into()))
    }

    /// Persist refreshed credentials back to the users table.
    fn persist_creds(&self, creds: &CredSession) -> CoreResult<()> {
        if creds.refreshed {
            let store = self.lock_store()?;
            store.set_user_tokens(&creds.user_id, &creds.access_token, creds.expiry.as_deref())?;
        }
        Ok(())
    }

    /// Create or refresh the user's subscription. Push when a topic is
    /// configured, polling otherwise; the stored cursor survives upgrades.
    pub async fn ensure_watch(&self, user: &DbUser) -> CoreResult<()> {
        let mut creds = creds_from_user(user, &self.config)?;

        match &self.config.pubsub_topic {
            Some(topic) => {
                let resp = self.gmail.start_watch(&mut creds, topic, &[]).await?;
                let expiry = epoch_millis_to_rfc3339(&resp.expiration);
                let store = self.lock_store()?;
                store.upsert_watch(
                    &user.id,
                    Some(topic),
                    Some(&resp.history_id).filter(|h| !h.is_empty()).map(|s| s.as_str()),
                    expiry.as_deref(),
                    WatchKind::Push,
                )?;
                log::info!("Watch: push subscription refreshed for {}", user.id);
            }
            None => {
                let profile = self.gmail.profile(&mut creds).await?;
                let store = self.lock_store()?;
                let existing_cursor = store
                    .get_watch(&user.id)?
                    .and_then(|w| w.history_cursor);
                let cursor = existing_cursor.unwrap_or(profile.history_id);
                store.upsert_watch(
                    &user.id,
                    None,
                    Some(&cursor),
                    None,
                    WatchKind::Polling,
                )?;
                log::info!("Watch: polling registered for {} at cursor {}", user.id, cursor);
            }
        }
        self.persist_creds(&creds)
    }

    /// Refresh push subscriptions whose expiry falls inside the renewal
    /// margin. Returns the number renewed.
    pub async fn renew_expiring(&self) -> CoreResult<usize> {
        let margin = chrono::Duration::minutes(self.config.watch_renewal_margin_min);
        let before = (Utc::now() + margin).to_rfc3339();
        let due = {
            let store = self.lock_store()?;
            store.watches_needing_renewal(&before)?
        };

        let mut renewed = 0;
        for watch in due {
            let user = {
                let store = self.lock_store()?;
                store.get_user(&watch.user_id)?
            };
            let user = match user {
                Some(u) if u.is_active && !u.auth_expired => u,
                _ => continue,
            };
            match self.ensure_watch(&user).await {
                Ok(()) => renewed += 1,
                Err(e) => {
                    log::warn!("Watch: renewal failed for {}: {}", watch.user_id, e);
                    self.note_auth_failure(&watch.user_id, &e)?;
                }
            }
        }
        Ok(renewed)
    }

    /// Accept a raw push notification. The envelope is opaque: all it
    /// contributes is "something changed for this user": one event enters
    /// the queue at top priority and the consumer re-reads history.
    pub fn handle_push(&self, user_id: &str) -> CoreResult<()> {
        let store = self.lock_store()?;
        store.touch_watch_event(user_id)?;
        enqueue_message_event(
            &store,
            &MessageEvent {
                user_id: user_id.to_string(),
                message_id: None,
                thread_id: None,
                history_cursor: None,
                source: EventSource::Push,
            },
            PRIORITY_TOP,
            self.config.queue_max_attempts,
        )?;
        Ok(())
    }

    /// Poll one user: read history since the stored cursor and emit one
    /// event per new message, in cursor order. Skips push users that have
    /// produced a push-driven event within the current interval.
    pub async fn poll_user(&self, user: &DbUser) -> CoreResult<usize> {
        let watch = {
            let store = self.lock_store()?;
            store.get_watch(&user.id)?
        };

        let watch = match watch {
            Some(w) if w.is_active => w,
            _ => {
                // First contact: register and start from the current cursor.
                self.ensure_watch(user).await?;
                return Ok(0);
            }
        };

        if watch.kind == WatchKind::Push && self.push_recently_active(&watch.last_event_at) {
            return Ok(0);
        }

        let cursor = match &watch.history_cursor {
            Some(c) => c.clone(),
            None => {
                self.ensure_watch(user).await?;
                return Ok(0);
            }
        };

        let mut creds = creds_from_user(user, &self.config)?;
        let page = match self
            .gmail
            .get_history(&mut creds, &cursor, HISTORY_PAGES_PER_POLL)
            .await
        {
            Ok(page) => page,
            Err(CoreError::NotFound(_)) => {
                // Cursor expired on the provider side: rebaseline. Anything
                // between the old cursor and now is picked up by the next
                // retroactive scan, not invented here.
                log::warn!("Watch: cursor expired for {}, rebaselining", user.id);
                let profile = self.gmail.profile(&mut creds).await?;
                {
                    let store = self.lock_store()?;
                    store.set_watch_cursor(&user.id, &profile.history_id)?;
                }
                self.persist_creds(&creds)?;
                return Ok(0);
            }
            Err(e) => {
                self.note_auth_failure(&user.id, &e)?;
                return Err(e);
            }
        };

        let emitted = {
            let store = self.lock_store()?;
            let mut emitted = 0;
            for message in &page.messages {
                enqueue_message_event(
                    &store,
                    &MessageEvent {
                        user_id: user.id.clone(),
                        message_id: Some(message.id.clone()),
                        thread_id: Some(message.thread_id.clone()).filter(|t| !t.is_empty()),
                        history_cursor: Some(message.cursor.clone()).filter(|c| !c.is_empty()),
                        source: EventSource::Poll,
                    },
                    PRIORITY_DEFAULT,
                    self.config.queue_max_attempts,
                )?;
                emitted += 1;
            }
            if let Some(latest) = &page.latest_cursor {
                store.set_watch_cursor(&user.id, latest)?;
            }
            emitted
        };

        self.persist_creds(&creds)?;
        if emitted > 0 {
            log::debug!("Watch: {} new messages for {}", emitted, user.id);
        }
        Ok(emitted)
    }

    /// Tear down on user deactivation.
    pub async fn stop_for_user(&self, user: &DbUser) -> CoreResult<()> {
        let mut creds = creds_from_user(user, &self.config)?;
        self.gmail.stop_watch(&mut creds).await?;
        let store = self.lock_store()?;
        store.deactivate_watch(&user.id)?;
        self.persist_creds(&creds)?;
        Ok(())
    }

    fn push_recently_active(&self, last_event_at: &Option<String>) -> bool {
        let last = match last_event_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        {
            Some(dt) => dt.with_timezone(&Utc),
            None => return false,
        };
        let interval = chrono::Duration::seconds(self.config.poll_interval.seconds() as i64);
        Utc::now() - last < interval
    }

    fn note_auth_failure(&self, user_id: &str, error: &CoreError) -> CoreResult<()> {
        if error.requires_user_action() {
            let store = self.lock_store()?;
            store.set_user_auth_expired(user_id, true)?;
        }
        Ok(())
    }
}

/// Gmail reports watch expiration as epoch milliseconds in a string.
fn epoch_millis_to_rfc3339(raw: &str) -> Option<String> {
    let millis: i64 = raw.parse().ok()?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339())
}
