//! Shared application state.
//!
//! One `AppState` is built at boot and handed to the HTTP router, the
//! scheduler and the queue workers. Everything inside is either immutable
//! configuration or its own synchronization domain.

use std::sync::Arc;

use crate::config::Config;
use crate::db::{Metastore, SharedStore};
use crate::events::EventBus;
use crate::extractor::{build_extractor, EntityExtractor};
use crate::gmail::GmailClient;
use crate::labels::LabelReflector;
use crate::rate_limit::RateLimiter;
use crate::resolver::{Resolver, ResolverConfig};
use crate::util::KeyedLocks;
use crate::watch::WatchCoordinator;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub limiter: Arc<RateLimiter>,
    pub gmail: Arc<GmailClient>,
    pub extractor: Arc<dyn EntityExtractor>,
    pub events: EventBus,
    /// Per-(user, thread) resolution critical sections.
    pub thread_locks: Arc<KeyedLocks>,
    /// Per-user singleflight for periodic jobs.
    pub job_locks: Arc<KeyedLocks>,
    pub resolver: Arc<Resolver>,
    pub reflector: Arc<LabelReflector>,
    pub watch: Arc<WatchCoordinator>,
}

impl AppState {
    pub fn new(config: Config, store: Metastore) -> Arc<Self> {
        let config = Arc::new(config);
        let store: SharedStore = crate::db::shared(store);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_read_per_sec,
            config.rate_write_per_sec,
            config.daily_call_ceiling,
        ));
        let gmail = Arc::new(GmailClient::new(limiter.clone()));
        let extractor = build_extractor(&config);
        let events = EventBus::new();
        let thread_locks = Arc::new(KeyedLocks::new());
        let job_locks = Arc::new(KeyedLocks::new());

        let resolver = Arc::new(Resolver::new(
            store.clone(),
            extractor.clone(),
            events.clone(),
            thread_locks.clone(),
            ResolverConfig::from(config.as_ref()),
            config.queue_max_attempts,
        ));
        let reflector = Arc::new(LabelReflector::new(gmail.clone(), store.clone()));
        let watch = Arc::new(WatchCoordinator::new(
            store.clone(),
            gmail.clone(),
            config.clone(),
        ));

        Arc::new(AppState {
            config,
            store,
            limiter,
            gmail,
            extractor,
            events,
            thread_locks,
            job_locks,
            resolver,
            reflector,
            watch,
        })
    }

    /// Test harness: in-memory-backed state with a custom extractor.
    pub fn for_tests_with_extractor(
        store: Metastore,
        extractor: Arc<dyn EntityExtractor>,
    ) -> Arc<Self> {
        let config = Arc::new(Config::for_tests());
        let store: SharedStore = crate::db::shared(store);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_read_per_sec,
            config.rate_write_per_sec,
            config.daily_call_ceiling,
        ));
        let gmail = Arc::new(GmailClient::new(limiter.clone()));
        let events = EventBus::new();
        let thread_locks = Arc::new(KeyedLocks::new());
        let job_locks = Arc::new(KeyedLocks::new());
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            extractor.clone(),
            events.clone(),
            thread_locks.clone(),
            ResolverConfig::from(config.as_ref()),
            config.queue_max_attempts,
        ));
        let reflector = Arc::new(LabelReflector::new(gmail.clone(), store.clone()));
        let watch = Arc::new(WatchCoordinator::new(
            store.clone(),
            gmail.clone(),
            config.clone(),
        ));
        Arc::new(AppState {
            config,
            store,
            limiter,
            gmail,
            extractor,
            events,
            thread_locks,
            job_locks,
            resolver,
            reflector,
            watch,
        })
    }
}
