//! Small shared utilities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Keyed async mutexes.
///
/// Backs two invariants: resolution for one `(user, thread)` is serial, and
/// periodic jobs are singleflight per user. Locks are created on first use
/// and kept for the life of the process; the key population is bounded by
/// active users and threads.
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        KeyedLocks {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(key.to_string()).or_default().clone()
    }

    /// Wait for the lock on `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Take the lock only if free: singleflight for periodic jobs.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate to a character boundary for log/audit snippets.
pub fn truncate_chars(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("u1:t1").await;
        assert!(locks.try_lock("u1:t1").is_none());
        // A different key is independent
        assert!(locks.try_lock("u1:t2").is_some());
        drop(guard);
        assert!(locks.try_lock("u1:t1").is_some());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("k").await;
        let locks2 = locks.clone();
        let handle = tokio::spawn(async move {
            let _g = locks2.lock("k").await;
            true
        });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
