//! Per-user token buckets over provider calls.
//!
//! Two buckets per user, read (metadata, fetch, history) and write (label
//! apply, batch modify, watch), plus one process-wide bucket enforcing the
//! project daily ceiling. Refusal is a normal result, never an error: the
//! caller gets the delay until the next token and decides whether to wait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which provider budget a call draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Read,
    Write,
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Ok,
    RetryAfter(Duration),
    /// The process-wide daily ceiling is spent. Resets at the next UTC day.
    DailyCeiling,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Bucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

struct Inner {
    buckets: HashMap<(String, CallKind), Bucket>,
    daily_used: u64,
    daily_day: String,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
    read_per_sec: f64,
    write_per_sec: f64,
    daily_ceiling: u64,
}

impl RateLimiter {
    pub fn new(read_per_sec: u32, write_per_sec: u32, daily_ceiling: u64) -> Self {
        RateLimiter {
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                daily_used: 0,
                daily_day: today(),
            }),
            read_per_sec: read_per_sec.max(1) as f64,
            write_per_sec: write_per_sec.max(1) as f64,
            daily_ceiling,
        }
    }

    /// Try to take one token for `(user, kind)`. Never blocks.
    pub fn acquire(&self, user: &str, kind: CallKind) -> Acquire {
        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            // A poisoned limiter must not wedge the pipeline; fail open.
            Err(poisoned) => poisoned.into_inner(),
        };

        let day = today();
        if inner.daily_day != day {
            inner.daily_day = day;
            inner.daily_used = 0;
        }
        if inner.daily_used >= self.daily_ceiling {
            return Acquire::DailyCeiling;
        }

        let rate = match kind {
            CallKind::Read => self.read_per_sec,
            CallKind::Write => self.write_per_sec,
        };
        let bucket = inner
            .buckets
            .entry((user.to_string(), kind))
            .or_insert_with(|| Bucket::new(rate, rate));

        match bucket.try_take(now) {
            Ok(()) => {
                inner.daily_used += 1;
                Acquire::Ok
            }
            Err(wait) => Acquire::RetryAfter(wait),
        }
    }

    /// Acquire, sleeping between refusals, giving up at `deadline`.
    ///
    /// Returns the remaining wait on refusal so queue workers can defer the
    /// item's visibility instead of spinning.
    pub async fn acquire_within(
        &self,
        user: &str,
        kind: CallKind,
        deadline: Duration,
    ) -> Result<(), Duration> {
        let started = Instant::now();
        loop {
            match self.acquire(user, kind) {
                Acquire::Ok => return Ok(()),
                Acquire::DailyCeiling => return Err(Duration::from_secs(3600)),
                Acquire::RetryAfter(wait) => {
                    let elapsed = started.elapsed();
                    if elapsed + wait > deadline {
                        return Err(wait);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refusal() {
        let limiter = RateLimiter::new(5, 5, 1_000);
        for _ in 0..5 {
            assert_eq!(limiter.acquire("u1", CallKind::Read), Acquire::Ok);
        }
        match limiter.acquire("u1", CallKind::Read) {
            Acquire::RetryAfter(wait) => assert!(wait <= Duration::from_millis(250)),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_buckets_are_per_user_and_kind() {
        let limiter = RateLimiter::new(1, 1, 1_000);
        assert_eq!(limiter.acquire("u1", CallKind::Read), Acquire::Ok);
        // u1's read budget is spent but u2's and u1's write budget are not.
        assert_eq!(limiter.acquire("u2", CallKind::Read), Acquire::Ok);
        assert_eq!(limiter.acquire("u1", CallKind::Write), Acquire::Ok);
        assert!(matches!(
            limiter.acquire("u1", CallKind::Read),
            Acquire::RetryAfter(_)
        ));
    }

    #[test]
    fn test_daily_ceiling() {
        let limiter = RateLimiter::new(100, 100, 2);
        assert_eq!(limiter.acquire("u1", CallKind::Read), Acquire::Ok);
        assert_eq!(limiter.acquire("u1", CallKind::Read), Acquire::Ok);
        assert_eq!(limiter.acquire("u1", CallKind::Read), Acquire::DailyCeiling);
        // Refusal is sticky for every user until the day rolls over.
        assert_eq!(limiter.acquire("u2", CallKind::Write), Acquire::DailyCeiling);
    }

    #[tokio::test]
    async fn test_acquire_within_eventually_succeeds() {
        let limiter = RateLimiter::new(5, 5, 1_000);
        for _ in 0..5 {
            limiter.acquire("u1", CallKind::Read);
        }
        // Bucket refills at 5/s, so one token is ~200ms away.
        let result = limiter
            .acquire_within("u1", CallKind::Read, Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_within_respects_deadline() {
        let limiter = RateLimiter::new(1, 1, 1_000);
        limiter.acquire("u1", CallKind::Write);
        let result = limiter
            .acquire_within("u1", CallKind::Write, Duration::from_millis(1))
            .await;
        assert!(result.is_err());
    }
}
