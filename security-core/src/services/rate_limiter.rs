//! Attempt counters for failure-prone operations.
//!
//! Storage failures fail open: a rate limit store outage must not lock every
//! principal out of login.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::store::RateLimitStore;
use crate::config::RateLimitConfig;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    /// Unix seconds of the last global purge, shared by all clones.
    last_purge: Arc<AtomicI64>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            last_purge: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Key for login throttling: lowercased identity plus client address.
    pub fn login_identifier(email: &str, ip: &str) -> String {
        format!("login:{}|{}", email.trim().to_lowercase(), ip)
    }

    pub fn password_reset_identifier(email: &str) -> String {
        format!("password_reset:{}", email.trim().to_lowercase())
    }

    /// `false` once `identifier` has used up `max_attempts` within its window.
    pub async fn check(&self, identifier: &str, max_attempts: u32) -> bool {
        self.check_at(identifier, max_attempts, Utc::now()).await
    }

    pub async fn check_at(&self, identifier: &str, max_attempts: u32, now: DateTime<Utc>) -> bool {
        self.maybe_purge(now).await;

        match self.store.find(identifier).await {
            Ok(Some(entry)) if !entry.is_expired(now) && entry.attempts >= max_attempts => {
                tracing::warn!(identifier, attempts = entry.attempts, "Rate limit exceeded");
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, identifier, "Rate limit check failed, allowing request");
                true
            }
        }
    }

    /// Count one attempt and push the window forward by `decay`. Returns the
    /// attempt count, or 0 when the store could not be reached.
    pub async fn increment(&self, identifier: &str, decay: Duration) -> u32 {
        self.increment_at(identifier, decay, Utc::now()).await
    }

    pub async fn increment_at(&self, identifier: &str, decay: Duration, now: DateTime<Utc>) -> u32 {
        match self.store.increment(identifier, now + decay, now).await {
            Ok(attempts) => {
                tracing::debug!(identifier, attempts, "Rate limit attempt recorded");
                attempts
            }
            Err(e) => {
                tracing::error!(error = %e, identifier, "Failed to record rate limit attempt");
                0
            }
        }
    }

    /// Reset the counter, typically after a successful login.
    pub async fn clear(&self, identifier: &str) {
        if let Err(e) = self.store.clear(identifier).await {
            tracing::error!(error = %e, identifier, "Failed to clear rate limit");
        }
    }

    /// Seconds until a blocked identifier may try again.
    pub async fn retry_after(&self, identifier: &str) -> Option<u64> {
        self.retry_after_at(identifier, Utc::now()).await
    }

    pub async fn retry_after_at(&self, identifier: &str, now: DateTime<Utc>) -> Option<u64> {
        match self.store.find(identifier).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                Some((entry.expires_at - now).num_seconds().max(0) as u64)
            }
            _ => None,
        }
    }

    pub async fn check_login(&self, identifier: &str) -> bool {
        self.check(identifier, self.config.login_attempts).await
    }

    pub async fn record_login_failure(&self, identifier: &str) -> u32 {
        self.increment(identifier, Duration::minutes(self.config.login_decay_minutes))
            .await
    }

    pub async fn check_password_reset(&self, identifier: &str) -> bool {
        self.check(identifier, self.config.password_reset_attempts)
            .await
    }

    pub async fn record_password_reset(&self, identifier: &str) -> u32 {
        self.increment(
            identifier,
            Duration::minutes(self.config.password_reset_decay_minutes),
        )
        .await
    }

    /// Delete every expired row. Runs at most once per purge interval across
    /// all clones of this limiter.
    async fn maybe_purge(&self, now: DateTime<Utc>) {
        let now_secs = now.timestamp();
        let last = self.last_purge.load(Ordering::Relaxed);
        if now_secs - last < self.config.purge_interval_seconds {
            return;
        }
        if self
            .last_purge
            .compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        match self.store.purge_expired(now).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(removed, "Purged expired rate limit entries");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Rate limit purge failed"),
        }
    }

    /// Unconditional purge for maintenance jobs.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, super::StoreError> {
        self.store.purge_expired(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;

    fn limiter() -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
        (store, limiter)
    }

    #[tokio::test]
    async fn test_blocks_after_max_attempts_and_clear_resets() {
        let (_, limiter) = limiter();
        let id = RateLimiter::login_identifier("Alice@Example.com", "203.0.113.7");
        let now = Utc::now();

        for expected in 1..=5 {
            assert!(limiter.check_at(&id, 5, now).await);
            assert_eq!(limiter.increment_at(&id, Duration::minutes(15), now).await, expected);
        }
        assert!(!limiter.check_at(&id, 5, now).await);

        limiter.clear(&id).await;
        assert!(limiter.check_at(&id, 5, now).await);
    }

    #[tokio::test]
    async fn test_window_expiry_unblocks() {
        let (_, limiter) = limiter();
        let now = Utc::now();
        for _ in 0..3 {
            limiter.increment_at("k", Duration::minutes(1), now).await;
        }
        assert!(!limiter.check_at("k", 3, now).await);
        assert!(limiter.check_at("k", 3, now + Duration::minutes(2)).await);
    }

    #[tokio::test]
    async fn test_each_attempt_pushes_the_window_forward() {
        let (store, limiter) = limiter();
        let t0 = Utc::now();
        let decay = Duration::minutes(15);

        limiter.increment_at("k", decay, t0).await;
        limiter.increment_at("k", decay, t0 + Duration::minutes(10)).await;

        let entry = RateLimitStore::find(store.as_ref(), "k").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.expires_at, t0 + Duration::minutes(25));

        // A fixed window would have closed at t0+15m
        assert!(!limiter.check_at("k", 2, t0 + Duration::minutes(20)).await);
        assert!(limiter.check_at("k", 2, t0 + Duration::minutes(26)).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let (store, limiter) = limiter();
        let now = Utc::now();
        for _ in 0..5 {
            limiter.increment_at("k", Duration::minutes(15), now).await;
        }
        store.set_unavailable(true);
        assert!(limiter.check_at("k", 5, now).await);
        assert_eq!(limiter.increment_at("k", Duration::minutes(15), now).await, 0);
    }

    #[test]
    fn test_identifiers_normalise_email() {
        assert_eq!(
            RateLimiter::login_identifier(" Bob@Example.COM ", "10.0.0.1"),
            "login:bob@example.com|10.0.0.1"
        );
        assert_eq!(
            RateLimiter::password_reset_identifier("Bob@Example.com"),
            "password_reset:bob@example.com"
        );
    }
}
