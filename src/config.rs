//! Environment-driven configuration.
//!
//! All knobs are read once at boot. Missing or malformed required values
//! abort the process before any worker starts; a half-configured pipeline
//! must never touch a mailbox.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Polling cadence for users without a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    Fast,
    Normal,
    Slow,
}

impl PollInterval {
    pub fn seconds(self) -> u64 {
        match self {
            PollInterval::Fast => 60,
            PollInterval::Normal => 300,
            PollInterval::Slow => 900,
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "fast" => Ok(PollInterval::Fast),
            "normal" => Ok(PollInterval::Normal),
            "slow" => Ok(PollInterval::Slow),
            other => bail!("POLL_INTERVAL must be fast|normal|slow, got '{other}'"),
        }
    }
}

/// Which entity extractor implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    Anthropic,
    /// Deterministic rule-based extractor. No network, no key. Used by tests
    /// and as a degraded fallback when no key is configured.
    Stub,
}

impl AiProvider {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "openai" => Ok(AiProvider::OpenAi),
            "anthropic" => Ok(AiProvider::Anthropic),
            "stub" => Ok(AiProvider::Stub),
            other => bail!("AI_PROVIDER must be openai|anthropic|stub, got '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub server_host: String,
    pub server_port: u16,

    pub ai_provider: AiProvider,
    pub ai_model: String,
    pub ai_api_key: Option<String>,
    pub ai_timeout_ms: u64,

    pub rate_read_per_sec: u32,
    pub rate_write_per_sec: u32,
    pub daily_call_ceiling: u64,

    pub poll_interval: PollInterval,

    pub confidence_auto: f64,
    pub confidence_review: f64,
    pub confidence_new: f64,

    pub batch_max: usize,
    pub queue_max_attempts: i32,
    pub watch_renewal_margin_min: i64,
    pub learning_pattern_min_support: usize,

    /// Pub/Sub topic for push notifications. Absent → polling only.
    pub pubsub_topic: Option<String>,
    pub google_client_id: String,
    pub google_client_secret: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} invalid: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "jobmail.db".to_string()));
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env_or("SERVER_PORT", 8700u16)?;

        let ai_provider = AiProvider::parse(
            &env::var("AI_PROVIDER").unwrap_or_else(|_| "stub".to_string()),
        )?;
        let ai_api_key = env::var("AI_API_KEY").ok();
        if matches!(ai_provider, AiProvider::OpenAi | AiProvider::Anthropic) && ai_api_key.is_none()
        {
            bail!("AI_API_KEY must be set when AI_PROVIDER is a hosted model");
        }
        let ai_model = env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let ai_timeout_ms = env_or("AI_TIMEOUT_MS", 60_000u64)?;

        let rate_read_per_sec = env_or("RATE_READ_PER_SEC", 5u32)?;
        let rate_write_per_sec = env_or("RATE_WRITE_PER_SEC", 5u32)?;
        let daily_call_ceiling = env_or("DAILY_CALL_CEILING", 1_000_000u64)?;

        let poll_interval =
            PollInterval::parse(&env::var("POLL_INTERVAL").unwrap_or_else(|_| "normal".into()))?;

        let confidence_auto = env_or("CONFIDENCE_AUTO", 0.80f64)?;
        let confidence_review = env_or("CONFIDENCE_REVIEW", 0.60f64)?;
        let confidence_new = env_or("CONFIDENCE_NEW", 0.40f64)?;
        if !(0.0..=1.0).contains(&confidence_auto)
            || !(0.0..=1.0).contains(&confidence_review)
            || !(0.0..=1.0).contains(&confidence_new)
        {
            bail!("confidence thresholds must be within [0, 1]");
        }
        if confidence_new > confidence_review || confidence_review > confidence_auto {
            bail!(
                "confidence thresholds must be ordered: CONFIDENCE_NEW <= CONFIDENCE_REVIEW <= CONFIDENCE_AUTO"
            );
        }

        let batch_max = env_or("BATCH_MAX", 100usize)?;
        let queue_max_attempts = env_or("QUEUE_MAX_ATTEMPTS", 3i32)?;
        let watch_renewal_margin_min = env_or("WATCH_RENEWAL_MARGIN_MIN", 60i64)?;
        let learning_pattern_min_support = env_or("LEARNING_PATTERN_MIN_SUPPORT", 3usize)?;

        let pubsub_topic = env::var("PUBSUB_TOPIC").ok().filter(|t| !t.is_empty());
        let google_client_id =
            env::var("GOOGLE_CLIENT_ID").context("GOOGLE_CLIENT_ID must be set")?;
        let google_client_secret =
            env::var("GOOGLE_CLIENT_SECRET").context("GOOGLE_CLIENT_SECRET must be set")?;

        Ok(Config {
            database_path,
            server_host,
            server_port,
            ai_provider,
            ai_model,
            ai_api_key,
            ai_timeout_ms,
            rate_read_per_sec,
            rate_write_per_sec,
            daily_call_ceiling,
            poll_interval,
            confidence_auto,
            confidence_review,
            confidence_new,
            batch_max,
            queue_max_attempts,
            watch_renewal_margin_min,
            learning_pattern_min_support,
            pubsub_topic,
            google_client_id,
            google_client_secret,
        })
    }

    /// A config with every knob at its default. Used by tests.
    pub fn for_tests() -> Self {
        Config {
            database_path: PathBuf::from(":memory:"),
            server_host: "127.0.0.1".into(),
            server_port: 0,
            ai_provider: AiProvider::Stub,
            ai_model: "stub".into(),
            ai_api_key: None,
            ai_timeout_ms: 60_000,
            rate_read_per_sec: 5,
            rate_write_per_sec: 5,
            daily_call_ceiling: 1_000_000,
            poll_interval: PollInterval::Normal,
            confidence_auto: 0.80,
            confidence_review: 0.60,
            confidence_new: 0.40,
            batch_max: 100,
            queue_max_attempts: 3,
            watch_renewal_margin_min: 60,
            learning_pattern_min_support: 3,
            pubsub_topic: None,
            google_client_id: "test-client".into(),
            google_client_secret: "test-secret".into(),
        }
    }
}
