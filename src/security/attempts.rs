//! Failed-login counter with progressive lockout.
//!
//! Flow Overview:
//! 1) Each failure for an identifier (`ip:username`) bumps a counter stored as
//!    JSON under `login_attempts:<identifier>`.
//! 2) Counters older than the window start over at 1.
//! 3) Reaching `max_attempts` locks the identifier for `lockout` since the
//!    last failure. Checking a lock never renews it.
//!
//! The read-modify-write against the store is not atomic; concurrent failures
//! for the same identifier may be under-counted by a small margin.

use crate::clock::{delta, Clock};
use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const KEY_PREFIX: &str = "login_attempts:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptPolicy {
    max_attempts: u32,
    lockout: Duration,
    window: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            lockout: Duration::from_secs(15 * 60),
            window: Duration::from_secs(60 * 60),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: Duration) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn lockout(&self) -> Duration {
        self.lockout
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Result of recording a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptStatus {
    pub count: u32,
    pub remaining_lockout_seconds: u64,
    pub is_locked: bool,
}

impl AttemptStatus {
    fn unrecorded() -> Self {
        Self {
            count: 0,
            remaining_lockout_seconds: 0,
            is_locked: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AttemptRecord {
    count: u32,
    window_start: DateTime<Utc>,
    last_attempt: DateTime<Utc>,
}

pub struct LoginAttemptLimiter {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    policy: AttemptPolicy,
}

impl LoginAttemptLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>, policy: AttemptPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AttemptPolicy {
        &self.policy
    }

    fn key(identifier: &str) -> String {
        format!("{KEY_PREFIX}{identifier}")
    }

    fn window_elapsed(&self, record: &AttemptRecord, now: DateTime<Utc>) -> bool {
        now - record.window_start > delta(self.policy.window)
    }

    fn lockout_left(&self, record: &AttemptRecord, now: DateTime<Utc>) -> u64 {
        let left = delta(self.policy.lockout) - (now - record.last_attempt);
        u64::try_from(left.num_seconds()).unwrap_or(0)
    }

    /// Load the record. Unreadable records are treated as absent.
    async fn load(&self, identifier: &str) -> Result<Option<AttemptRecord>, crate::store::StoreError> {
        let Some(raw) = self.store.get(&Self::key(identifier)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!("Discarding malformed attempt record: {err}");
                Ok(None)
            }
        }
    }

    async fn clear(&self, identifier: &str) {
        if let Err(err) = self.store.delete(&Self::key(identifier)).await {
            warn!("Failed to clear login attempts: {err}");
        }
    }

    /// Count a failed login for `identifier`.
    #[instrument(skip(self))]
    pub async fn record_failure(&self, identifier: &str) -> AttemptStatus {
        let now = self.clock.now();
        let previous = match self.load(identifier).await {
            Ok(record) => record,
            Err(err) => {
                warn!("Attempt store unavailable, failure not recorded: {err}");
                return AttemptStatus::unrecorded();
            }
        };

        let record = match previous {
            Some(record) if !self.window_elapsed(&record, now) => AttemptRecord {
                count: record.count.saturating_add(1),
                window_start: record.window_start,
                last_attempt: now,
            },
            _ => AttemptRecord {
                count: 1,
                window_start: now,
                last_attempt: now,
            },
        };

        let is_locked = record.count >= self.policy.max_attempts;
        let remaining_lockout_seconds = if is_locked {
            self.lockout_left(&record, now)
        } else {
            0
        };

        match serde_json::to_string(&record) {
            Ok(raw) => {
                let ttl = self.policy.window.max(self.policy.lockout);
                if let Err(err) = self.store.set(&Self::key(identifier), &raw, Some(ttl)).await {
                    warn!("Attempt store unavailable, failure not recorded: {err}");
                }
            }
            Err(err) => warn!("Failed to encode attempt record: {err}"),
        }

        debug!(count = record.count, is_locked, "login failure recorded");

        AttemptStatus {
            count: record.count,
            remaining_lockout_seconds,
            is_locked,
        }
    }

    /// Forget every failure for `identifier`.
    #[instrument(skip(self))]
    pub async fn record_success(&self, identifier: &str) {
        self.clear(identifier).await;
    }

    /// Whether `identifier` is currently locked out.
    ///
    /// Records past their window, and locks whose duration has elapsed, are
    /// deleted on the way.
    #[instrument(skip(self))]
    pub async fn check_lockout(&self, identifier: &str) -> bool {
        let now = self.clock.now();
        let record = match self.load(identifier).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err) => {
                warn!("Attempt store unavailable, skipping lockout check: {err}");
                return false;
            }
        };

        if self.window_elapsed(&record, now) {
            self.clear(identifier).await;
            return false;
        }

        if record.count >= self.policy.max_attempts {
            if now - record.last_attempt < delta(self.policy.lockout) {
                return true;
            }
            self.clear(identifier).await;
        }

        false
    }

    /// Attempts left before lockout; `max_attempts` when nothing is recorded.
    #[instrument(skip(self))]
    pub async fn remaining_attempts(&self, identifier: &str) -> u32 {
        let now = self.clock.now();
        match self.load(identifier).await {
            Ok(Some(record)) if !self.window_elapsed(&record, now) => {
                self.policy.max_attempts.saturating_sub(record.count)
            }
            Ok(_) => self.policy.max_attempts,
            Err(err) => {
                warn!("Attempt store unavailable, assuming no failures: {err}");
                self.policy.max_attempts
            }
        }
    }

    /// Seconds until an active lockout ends, 0 when not locked.
    #[instrument(skip(self))]
    pub async fn lockout_remaining(&self, identifier: &str) -> u64 {
        let now = self.clock.now();
        match self.load(identifier).await {
            Ok(Some(record))
                if record.count >= self.policy.max_attempts
                    && !self.window_elapsed(&record, now) =>
            {
                self.lockout_left(&record, now)
            }
            Ok(_) => 0,
            Err(err) => {
                warn!("Attempt store unavailable: {err}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{testing::UnavailableStore, MemoryStore};
    use proptest::prelude::*;

    fn limiter() -> (Arc<ManualClock>, LoginAttemptLimiter) {
        let clock = Arc::new(ManualClock::fixed());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = LoginAttemptLimiter::new(store, clock.clone(), AttemptPolicy::new());
        (clock, limiter)
    }

    #[tokio::test]
    async fn fresh_identifier_has_full_attempts() {
        let (_clock, limiter) = limiter();
        assert!(!limiter.check_lockout("1.2.3.4:bob").await);
        assert_eq!(limiter.remaining_attempts("1.2.3.4:bob").await, 5);
        assert_eq!(limiter.lockout_remaining("1.2.3.4:bob").await, 0);
    }

    #[tokio::test]
    async fn limiter_locks_after_max_attempts() {
        let (clock, limiter) = limiter();
        let id = "1.2.3.4:bob";
        for n in 1..5 {
            let status = limiter.record_failure(id).await;
            assert_eq!(status.count, n);
            assert!(!status.is_locked);
            assert_eq!(status.remaining_lockout_seconds, 0);
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(limiter.remaining_attempts(id).await, 1);

        let status = limiter.record_failure(id).await;
        assert!(status.is_locked);
        assert_eq!(status.count, 5);
        assert_eq!(status.remaining_lockout_seconds, 900);
        assert!(limiter.check_lockout(id).await);
        assert_eq!(limiter.remaining_attempts(id).await, 0);
    }

    #[tokio::test]
    async fn lockout_lasts_from_last_failure_and_is_not_renewed_by_checks() {
        let (clock, limiter) = limiter();
        let id = "1.2.3.4:bob";
        for _ in 0..5 {
            limiter.record_failure(id).await;
        }

        clock.advance(Duration::from_secs(600));
        assert!(limiter.check_lockout(id).await);
        assert_eq!(limiter.lockout_remaining(id).await, 300);

        clock.advance(Duration::from_secs(299));
        assert!(limiter.check_lockout(id).await);

        clock.advance(Duration::from_secs(1));
        assert!(!limiter.check_lockout(id).await);
        // the elapsed lock was cleared
        assert_eq!(limiter.remaining_attempts(id).await, 5);
    }

    #[tokio::test]
    async fn failure_after_window_starts_over() {
        let (clock, limiter) = limiter();
        let id = "1.2.3.4:bob";
        for _ in 0..3 {
            limiter.record_failure(id).await;
        }
        clock.advance(Duration::from_secs(3601));
        let status = limiter.record_failure(id).await;
        assert_eq!(status.count, 1);
        assert_eq!(limiter.remaining_attempts(id).await, 4);
    }

    #[tokio::test]
    async fn success_clears_failures() {
        let (_clock, limiter) = limiter();
        let id = "1.2.3.4:bob";
        for _ in 0..5 {
            limiter.record_failure(id).await;
        }
        limiter.record_success(id).await;
        assert!(!limiter.check_lockout(id).await);
        assert_eq!(limiter.remaining_attempts(id).await, 5);
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let (_clock, limiter) = limiter();
        for _ in 0..5 {
            limiter.record_failure("1.2.3.4:bob").await;
        }
        assert!(limiter.check_lockout("1.2.3.4:bob").await);
        assert!(!limiter.check_lockout("1.2.3.4:alice").await);
        assert!(!limiter.check_lockout("5.6.7.8:bob").await);
    }

    #[tokio::test]
    async fn limiter_fails_open_when_store_is_down() {
        let clock = Arc::new(ManualClock::fixed());
        let limiter =
            LoginAttemptLimiter::new(Arc::new(UnavailableStore), clock, AttemptPolicy::new());
        let status = limiter.record_failure("1.2.3.4:bob").await;
        assert_eq!(status, AttemptStatus::unrecorded());
        assert!(!limiter.check_lockout("1.2.3.4:bob").await);
        assert_eq!(limiter.remaining_attempts("1.2.3.4:bob").await, 5);
    }

    #[tokio::test]
    async fn custom_policy_is_honoured() {
        let clock = Arc::new(ManualClock::fixed());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let policy = AttemptPolicy::new()
            .with_max_attempts(2)
            .with_lockout(Duration::from_secs(60));
        let limiter = LoginAttemptLimiter::new(store, clock.clone(), policy);
        limiter.record_failure("x").await;
        let status = limiter.record_failure("x").await;
        assert!(status.is_locked);
        assert_eq!(status.remaining_lockout_seconds, 60);
        clock.advance(Duration::from_secs(60));
        assert!(!limiter.check_lockout("x").await);
    }

    proptest! {
        #[test]
        fn success_always_restores_full_attempts(failures in 0u32..20, gaps in proptest::collection::vec(0u64..2000, 20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            rt.block_on(async {
                let (clock, limiter) = limiter();
                for i in 0..failures {
                    clock.advance(Duration::from_secs(gaps[i as usize]));
                    limiter.record_failure("p:user").await;
                }
                limiter.record_success("p:user").await;
                prop_assert!(!limiter.check_lockout("p:user").await);
                prop_assert_eq!(limiter.remaining_attempts("p:user").await, 5);
                Ok(())
            })?;
        }

        #[test]
        fn failure_past_window_resets_count(prior in 1u32..30, extra in 1u64..10_000) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            rt.block_on(async {
                let (clock, limiter) = limiter();
                for _ in 0..prior {
                    limiter.record_failure("p:user").await;
                }
                clock.advance(Duration::from_secs(3600 + extra));
                let status = limiter.record_failure("p:user").await;
                prop_assert_eq!(status.count, 1);
                Ok(())
            })?;
        }
    }
}
