mod common;

use chrono::{Duration, Utc};
use security_core::services::{RateLimitStore, RateLimiter};

#[tokio::test]
async fn test_login_lockout_and_reset() {
    let app = common::TestApp::spawn();
    let limiter = &app.core.rate_limiter;
    let id = RateLimiter::login_identifier("Editor@Example.com ", common::CLIENT_IP);
    assert_eq!(id, format!("login:editor@example.com|{}", common::CLIENT_IP));

    for attempt in 1..=5 {
        assert!(limiter.check_login(&id).await, "attempt {} allowed", attempt);
        assert_eq!(limiter.record_login_failure(&id).await, attempt);
    }
    assert!(!limiter.check_login(&id).await);

    let retry = limiter.retry_after(&id).await.unwrap();
    assert!(retry > 14 * 60 && retry <= 15 * 60);

    // Other addresses are unaffected
    let other = RateLimiter::login_identifier("editor@example.com", "203.0.113.4");
    assert!(limiter.check_login(&other).await);

    limiter.clear(&id).await;
    assert!(limiter.check_login(&id).await);
    assert!(limiter.retry_after(&id).await.is_none());
}

#[tokio::test]
async fn test_window_expiry_restarts_count() {
    let app = common::TestApp::spawn();
    let limiter = &app.core.rate_limiter;
    let id = RateLimiter::password_reset_identifier("editor@example.com");
    let start = Utc::now();

    for _ in 0..3 {
        limiter.increment_at(&id, Duration::minutes(60), start).await;
    }
    assert!(!limiter.check_at(&id, 3, start).await);

    let later = start + Duration::minutes(61);
    assert!(limiter.check_at(&id, 3, later).await);
    assert_eq!(
        limiter.increment_at(&id, Duration::minutes(60), later).await,
        1
    );
}

#[tokio::test]
async fn test_fails_open_when_store_is_down() {
    let app = common::TestApp::spawn();
    let limiter = &app.core.rate_limiter;
    let id = RateLimiter::login_identifier("editor@example.com", common::CLIENT_IP);

    for _ in 0..5 {
        limiter.record_login_failure(&id).await;
    }
    assert!(!limiter.check_login(&id).await);

    app.store.set_unavailable(true);
    assert!(limiter.check_login(&id).await);
    assert_eq!(limiter.record_login_failure(&id).await, 0);

    app.store.set_unavailable(false);
    let entry = RateLimitStore::find(app.store.as_ref(), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempts, 5);
}

#[tokio::test]
async fn test_window_slides_with_each_failure() {
    let app = common::TestApp::spawn();
    let limiter = &app.core.rate_limiter;
    let id = RateLimiter::login_identifier("editor@example.com", common::CLIENT_IP);
    let t0 = Utc::now();

    for minute in [0, 5, 10, 14, 18] {
        limiter
            .increment_at(&id, Duration::minutes(15), t0 + Duration::minutes(minute))
            .await;
    }

    let entry = RateLimitStore::find(app.store.as_ref(), &id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 5);
    assert_eq!(entry.expires_at, t0 + Duration::minutes(33));
    assert!(!limiter.check_at(&id, 5, t0 + Duration::minutes(30)).await);
    assert_eq!(
        limiter.retry_after_at(&id, t0 + Duration::minutes(30)).await,
        Some(180)
    );
}
