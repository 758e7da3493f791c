//! Periodic work: polling, queue drains, watch renewal, learning passes.
//!
//! No scheduling framework: each job is a tokio loop on a jittered
//! interval with a per-user singleflight lock, so no two instances of the
//! same job overlap for one user. Shutdown cancels every loop and releases
//! in-flight reservations so queue items become visible again.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::error::CoreResult;
use crate::learning::process_corrections;
use crate::state::AppState;
use crate::workers::{
    drain_ai_queue, drain_notification_queue, drain_reflect_queue, reconcile_pending_reflections,
    release_worker,
};

const NOTIFICATION_DRAIN_SECS: u64 = 5;
const NOTIFICATION_BATCH: usize = 10;

/// AI work is slower and rate-sensitive: longer cadence, smaller batches.
const AI_DRAIN_SECS: u64 = 10;
const AI_BATCH: usize = 4;

const REFLECT_DRAIN_SECS: u64 = 10;
const REFLECT_BATCH: usize = 10;

const WATCH_RENEWAL_SECS: u64 = 15 * 60;
const LEARNING_PASS_SECS: u64 = 10 * 60;
const RECONCILE_SECS: u64 = 30 * 60;
const PRUNE_SECS: u64 = 60 * 60;

/// Completed queue items are kept this long for inspection.
const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 3600);

pub struct Scheduler {
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Self {
        Scheduler { state, shutdown }
    }

    /// Run every periodic loop until shutdown. Resolves when all loops have
    /// stopped and worker leases are released.
    pub async fn run(self) {
        log::info!("Scheduler: started");
        let mut handles = Vec::new();

        handles.push(self.spawn_loop("poll", self.state.config.poll_interval.seconds(), poll_tick));
        handles.push(self.spawn_loop("notify-drain", NOTIFICATION_DRAIN_SECS, notification_tick));
        handles.push(self.spawn_loop("ai-drain", AI_DRAIN_SECS, ai_tick));
        handles.push(self.spawn_loop("reflect-drain", REFLECT_DRAIN_SECS, reflect_tick));
        handles.push(self.spawn_loop("watch-renew", WATCH_RENEWAL_SECS, renewal_tick));
        handles.push(self.spawn_loop("learning", LEARNING_PASS_SECS, learning_tick));
        handles.push(self.spawn_loop("reconcile", RECONCILE_SECS, reconcile_tick));
        handles.push(self.spawn_loop("prune", PRUNE_SECS, prune_tick));

        for handle in handles {
            let _ = handle.await;
        }

        // Loops are done; free anything still leased under our worker names.
        for worker in [
            "sched:notify-drain",
            "sched:ai-drain",
            "sched:reflect-drain",
        ] {
            let _ = release_worker(&self.state, worker);
        }
        log::info!("Scheduler: stopped");
    }

    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        interval_secs: u64,
        tick: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<AppState>, &'static str) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CoreResult<()>> + Send,
    {
        let state = self.state.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let sleep_for = jittered(interval_secs);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = tick(state.clone(), name).await {
                    log::warn!("Scheduler: {name} tick failed: {e}");
                }
            }
            log::debug!("Scheduler: {name} loop exited");
        })
    }
}

/// Interval plus up to 10% random jitter, so multi-process deployments do
/// not stampede the provider on the same second.
fn jittered(base_secs: u64) -> Duration {
    let jitter_max = (base_secs / 10).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_max);
    Duration::from_secs(base_secs + jitter)
}

async fn poll_tick(state: Arc<AppState>, name: &'static str) -> CoreResult<()> {
    let users = {
        let store = state
            .store
            .lock()
            .map_err(|_| crate::error::CoreError::PersistenceConflict("store lock".into()))?;
        store.list_workable_users()?
    };

    for user in users {
        // Singleflight per user: a slow poll never overlaps itself.
        let key = format!("{name}:{}", user.id);
        let _guard = match state.job_locks.try_lock(&key) {
            Some(guard) => guard,
            None => continue,
        };
        if let Err(e) = state.watch.poll_user(&user).await {
            log::warn!("Scheduler: poll failed for {}: {}", user.id, e);
        }
    }
    Ok(())
}

async fn notification_tick(state: Arc<AppState>, name: &'static str) -> CoreResult<()> {
    let worker = format!("sched:{name}");
    drain_notification_queue(&state, &worker, NOTIFICATION_BATCH).await?;
    Ok(())
}

async fn ai_tick(state: Arc<AppState>, name: &'static str) -> CoreResult<()> {
    let worker = format!("sched:{name}");
    drain_ai_queue(&state, &worker, AI_BATCH).await?;
    Ok(())
}

async fn reflect_tick(state: Arc<AppState>, name: &'static str) -> CoreResult<()> {
    let worker = format!("sched:{name}");
    drain_reflect_queue(&state, &worker, REFLECT_BATCH).await?;
    Ok(())
}

async fn renewal_tick(state: Arc<AppState>, _name: &'static str) -> CoreResult<()> {
    let renewed = state.watch.renew_expiring().await?;
    if renewed > 0 {
        log::info!("Scheduler: renewed {renewed} watch subscriptions");
    }
    Ok(())
}

async fn learning_tick(state: Arc<AppState>, name: &'static str) -> CoreResult<()> {
    let users = {
        let store = state
            .store
            .lock()
            .map_err(|_| crate::error::CoreError::PersistenceConflict("store lock".into()))?;
        store.list_workable_users()?
    };
    for user in users {
        let key = format!("{name}:{}", user.id);
        let _guard = match state.job_locks.try_lock(&key) {
            Some(guard) => guard,
            None => continue,
        };
        let stats = {
            let store = state
                .store
                .lock()
                .map_err(|_| crate::error::CoreError::PersistenceConflict("store lock".into()))?;
            process_corrections(&store, &user.id, state.config.learning_pattern_min_support)?
        };
        if stats.patterns_upserted > 0 {
            log::info!(
                "Scheduler: learning pass for {} upserted {} patterns",
                user.id,
                stats.patterns_upserted
            );
        }
    }
    Ok(())
}

async fn reconcile_tick(state: Arc<AppState>, _name: &'static str) -> CoreResult<()> {
    let users = {
        let store = state
            .store
            .lock()
            .map_err(|_| crate::error::CoreError::PersistenceConflict("store lock".into()))?;
        store.list_workable_users()?
    };
    for user in users {
        let queued = reconcile_pending_reflections(&state, &user.id)?;
        if queued > 0 {
            log::info!(
                "Scheduler: requeued {queued} pending reflections for {}",
                user.id
            );
        }
    }
    Ok(())
}

async fn prune_tick(state: Arc<AppState>, _name: &'static str) -> CoreResult<()> {
    let store = state
        .store
        .lock()
        .map_err(|_| crate::error::CoreError::PersistenceConflict("store lock".into()))?;
    let removed = store.prune_completed_items(COMPLETED_RETENTION)?;
    if removed > 0 {
        log::debug!("Scheduler: pruned {removed} completed queue items");
    }
    Ok(())
}
