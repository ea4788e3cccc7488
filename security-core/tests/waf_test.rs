mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{body_text, test_config, TestApp, CLIENT_IP};
use security_core::models::ThreatKind;

#[tokio::test]
async fn test_path_traversal_in_query_is_blocked() {
    let app = TestApp::spawn();
    let mut client = app.client();

    let response = client.get("/ping?file=../../etc/passwd").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_text(response).await;
    assert!(body.starts_with("403 Forbidden\nReference: "));
    let reference = body.trim_end().rsplit(' ').next().unwrap();
    assert_eq!(reference.len(), 8);
    assert!(reference.chars().all(|c| c.is_ascii_hexdigit()));
    // The matched family is not disclosed
    assert!(!body.contains("file_inclusion"));

    let events = app.store.waf_events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].threat, ThreatKind::FileInclusion);
    assert_eq!(events[0].source, "get:file");
    assert_eq!(events[0].ip_address, CLIENT_IP);

    let audit = app.core.audit.recent(10).await.unwrap();
    assert!(audit.iter().any(|e| e.event_type == "waf_block"));
}

#[tokio::test]
async fn test_script_in_form_body_is_blocked_before_csrf() {
    let app = TestApp::spawn();
    let mut client = app.client();

    let response = client
        .send(
            Request::builder()
                .method("POST")
                .uri("/articles")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded"),
            Body::from("title=%3Cscript%3Ealert(1)%3C%2Fscript%3E"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = app.store.waf_events().unwrap();
    assert_eq!(events[0].threat, ThreatKind::Xss);
    assert_eq!(events[0].source, "post:title");
}

fn multipart_body(boundary: &str, title: &str, attachment: &str) -> String {
    format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"title\"\r\n\r\n\
         {title}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"attachment\"; filename=\"draft.html\"\r\n\
         Content-Type: text/html\r\n\r\n\
         {attachment}\r\n\
         --{b}--\r\n",
        b = boundary,
        title = title,
        attachment = attachment,
    )
}

#[tokio::test]
async fn test_script_in_multipart_field_is_blocked() {
    let app = TestApp::spawn();
    let mut client = app.client();
    let token = client.csrf_token().await;

    let response = client
        .send(
            Request::builder()
                .method("POST")
                .uri("/articles")
                .header("x-csrf-token", &token)
                .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XyZ42"),
            Body::from(multipart_body("XyZ42", "<script>alert(1)</script>", "plain notes")),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("Reference: "));

    let events = app.store.waf_events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].threat, ThreatKind::Xss);
    assert_eq!(events[0].source, "post:title");
}

#[tokio::test]
async fn test_multipart_file_parts_are_not_scanned() {
    let app = TestApp::spawn();
    let mut client = app.client();
    let token = client.csrf_token().await;

    let response = client
        .send(
            Request::builder()
                .method("POST")
                .uri("/articles")
                .header("x-csrf-token", &token)
                .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XyZ42"),
            Body::from(multipart_body(
                "XyZ42",
                "Release notes",
                "<p>Embed with <script src=\"/player.js\"></script></p>",
            )),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(app.store.waf_events().unwrap().is_empty());
}

#[tokio::test]
async fn test_nested_json_value_is_blocked() {
    let app = TestApp::spawn();
    let mut client = app.client();

    let response = client
        .post_json(
            "/articles",
            serde_json::json!({ "page": { "body": "1 UNION SELECT password FROM admins" } }),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = app.store.waf_events().unwrap();
    assert_eq!(events[0].threat, ThreatKind::SqlInjection);
    assert_eq!(events[0].source, "json:/page/body");
}

#[tokio::test]
async fn test_benign_traffic_passes() {
    let app = TestApp::spawn();
    let mut client = app.client();

    let response = client.get("/ping?page=2&sort=title&q=select+a+theme").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "pong");

    let token = client.csrf_token().await;
    let response = client
        .post_json(
            "/articles",
            serde_json::json!({ "title": "Q&A: how we cut load times", "tags": ["news"] }),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(app.store.waf_events().unwrap().is_empty());
}

#[tokio::test]
async fn test_scanner_user_agent_is_blocked() {
    let app = TestApp::spawn();
    let mut client = app.client();

    let response = client
        .send(
            Request::builder()
                .uri("/ping")
                .header(header::USER_AGENT, "sqlmap/1.7.2#stable (https://sqlmap.org)"),
            Body::empty(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.store.waf_events().unwrap()[0].threat, ThreatKind::BadBot);
}

#[tokio::test]
async fn test_blacklisted_ip_is_refused() {
    let app = TestApp::spawn();
    let mut client = app.client();

    app.core
        .firewall
        .blacklist_ip(CLIENT_IP, "manual", None)
        .await
        .unwrap();

    let response = client.get("/ping").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("Reference: "));
    // Blacklist hits are not recorded as attacks
    assert!(app.store.waf_events().unwrap().is_empty());
}

#[tokio::test]
async fn test_repeat_offender_is_blacklisted() {
    let mut config = test_config();
    config.waf.auto_blacklist_threshold = 2;
    let app = TestApp::with_config(config);
    let mut client = app.client();

    assert_eq!(client.get("/ping").await.status(), StatusCode::OK);
    for _ in 0..2 {
        let response = client.get("/ping?q=%3Cscript%3E").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // Clean requests from the same address are now refused too
    assert_eq!(client.get("/ping").await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mut config = test_config();
    config.waf.max_body_bytes = 64;
    let app = TestApp::with_config(config);
    let mut client = app.client();

    let response = client
        .send(
            Request::builder()
                .method("POST")
                .uri("/articles")
                .header(header::CONTENT_TYPE, "text/plain"),
            Body::from("a".repeat(1024)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_disabled_firewall_lets_everything_through() {
    let mut config = test_config();
    config.waf.enabled = false;
    let app = TestApp::with_config(config);
    let mut client = app.client();

    let response = client.get("/ping?q=%3Cscript%3E").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.store.waf_events().unwrap().is_empty());
}
