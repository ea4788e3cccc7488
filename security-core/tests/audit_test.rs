mod common;

use chrono::{Duration, Utc};
use security_core::{
    context::RequestContext,
    maintenance,
    models::{AuditEvent, PrincipalKey, PrincipalType, RememberToken, Severity},
    services::{AuditContext, AuditStore, TokenStore},
};

#[tokio::test]
async fn test_events_carry_principal_and_request() {
    let app = common::TestApp::spawn();
    let editor = common::editor();
    let ctx = AuditContext::new(RequestContext::system("/admin/login")).with_principal(&editor);

    assert!(app.core.audit.login_success(&ctx, true).await);
    assert!(
        app.core
            .audit
            .login_failure(&ctx, "editor@example.com", "bad_password")
            .await
    );

    let events = app.core.audit.recent(10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "login_failure");
    assert_eq!(events[0].severity, Severity::Warning);
    assert_eq!(events[1].event_type, "login_success");

    let event = &events[1];
    let principal = event.principal.as_ref().unwrap();
    assert_eq!(principal.email, "editor@example.com");
    assert_eq!(principal.role.as_deref(), Some("editor"));
    assert_eq!(event.tenant_id, Some(5));
    assert_eq!(event.uri.as_deref(), Some("/admin/login"));
}

#[tokio::test]
async fn test_store_outage_is_reported_not_raised() {
    let app = common::TestApp::spawn();
    let ctx = AuditContext::new(RequestContext::system("/admin/logout"));

    app.store.set_unavailable(true);
    assert!(!app.core.audit.logout(&ctx).await);
    assert!(app.core.audit.recent(10).await.is_err());

    app.store.set_unavailable(false);
    assert!(app.core.audit.recent(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_job() {
    let app = common::TestApp::spawn();
    let now = Utc::now();

    let mut old = AuditEvent::new("logout", Severity::Info, serde_json::json!({}));
    old.created_at = now - Duration::days(120);
    AuditStore::insert(app.store.as_ref(), &old).await.unwrap();
    let recent = AuditEvent::new("logout", Severity::Info, serde_json::json!({}));
    AuditStore::insert(app.store.as_ref(), &recent).await.unwrap();

    let key = PrincipalKey {
        principal_type: PrincipalType::Admin,
        principal_id: 1,
    };
    let (_, expired) = RememberToken::issue(key, Duration::days(1), None, None, now - Duration::days(2));
    TokenStore::rotate(app.store.as_ref(), &expired).await.unwrap();

    let report = maintenance::cleanup(app.store.clone(), 90, now).await.unwrap();
    assert_eq!(report.audit_events, 1);
    assert_eq!(report.remember_tokens, 1);

    let remaining = app.core.audit.recent(10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].event_id, recent.event_id);

    // Nothing left to do on a second run
    let report = maintenance::cleanup(app.store.clone(), 90, now).await.unwrap();
    assert_eq!(report, maintenance::CleanupReport::default());
}
