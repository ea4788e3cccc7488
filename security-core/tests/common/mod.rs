//! Shared harness for the HTTP-level integration tests.
//!
//! Builds the full security stack over [`MemoryStore`] and a handful of
//! routes that exercise sessions, login and CSRF.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, request::Builder, Request, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use security_core::{
    apply_security_layers,
    config::SecurityConfig,
    middleware::CurrentSession,
    models::{Principal, PrincipalKey, PrincipalType},
    services::{MemoryStore, PrincipalDirectory},
    SecurityCore,
};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::util::ServiceExt;

pub const CLIENT_IP: &str = "198.51.100.7";

#[derive(Clone)]
struct TestState {
    core: SecurityCore,
    store: Arc<MemoryStore>,
}

#[derive(Deserialize)]
struct LoginBody {
    principal_id: i64,
    #[serde(default)]
    remember: bool,
}

pub fn test_config() -> SecurityConfig {
    let mut config = SecurityConfig::default();
    config.log_level = "error".to_string();
    config.session.cookie_secure = false;
    config
}

pub fn editor() -> Principal {
    Principal::new(1, PrincipalType::Admin, "editor@example.com")
        .with_tenant(5)
        .with_role("editor")
}

/// Test application plus the store behind it.
pub struct TestApp {
    pub router: Router,
    pub core: SecurityCore,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SecurityConfig) -> Self {
        let (core, store) = SecurityCore::in_memory(config);
        store
            .insert_principal(editor())
            .expect("Failed to seed principal");

        let state = TestState {
            core: core.clone(),
            store: store.clone(),
        };

        let routes = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route("/me", get(me))
            .route("/login", post(login))
            .route("/logout", post(logout))
            .route("/articles", post(|| async { (StatusCode::CREATED, "created") }))
            .with_state(state);

        Self {
            router: apply_security_layers(routes, core.clone()),
            core,
            store,
        }
    }

    pub fn client(&self) -> TestClient {
        TestClient {
            router: self.router.clone(),
            cookies: BTreeMap::new(),
        }
    }
}

async fn me(session: CurrentSession) -> Json<serde_json::Value> {
    let principal = session.principal().await;
    Json(serde_json::json!({
        "principal": principal.map(|p| p.email),
        "csrf_token": session.csrf_token().await,
    }))
}

async fn login(
    State(state): State<TestState>,
    session: CurrentSession,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let key = PrincipalKey {
        principal_type: PrincipalType::Admin,
        principal_id: body.principal_id,
    };
    let principal = state
        .store
        .find_principal(key)
        .await
        .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown principal")))?;

    let mut active = session.lock().await;
    state
        .core
        .sessions
        .login(&mut active, principal, body.remember, session.request())
        .await?;

    Ok(Json(serde_json::json!({ "csrf_token": active.state.csrf_token })))
}

async fn logout(State(state): State<TestState>, session: CurrentSession) -> StatusCode {
    let mut active = session.lock().await;
    state
        .core
        .sessions
        .destroy(&mut active, session.remember_token())
        .await;
    StatusCode::NO_CONTENT
}

/// Minimal browser: remembers cookies between requests.
pub struct TestClient {
    router: Router,
    pub cookies: BTreeMap<String, String>,
}

impl TestClient {
    pub async fn get(&mut self, uri: &str) -> Response {
        self.send(Request::builder().method("GET").uri(uri), Body::empty())
            .await
    }

    pub async fn post_json(
        &mut self,
        uri: &str,
        body: serde_json::Value,
        csrf_token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = csrf_token {
            builder = builder.header("x-csrf-token", token);
        }
        self.send(builder, Body::from(body.to_string())).await
    }

    pub async fn send(&mut self, builder: Builder, body: Body) -> Response {
        let mut builder = builder.header("x-forwarded-for", CLIENT_IP);
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(header::COOKIE, cookie);
        }

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        for (name, value) in set_cookies(&response) {
            if value.is_empty() {
                self.cookies.remove(&name);
            } else {
                self.cookies.insert(name, value);
            }
        }
        response
    }

    /// Fetch `/me` and return the current CSRF token.
    pub async fn csrf_token(&mut self) -> String {
        let response = self.get("/me").await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["csrf_token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub async fn whoami(&mut self) -> Option<String> {
        let response = self.get("/me").await;
        body_json(response).await["principal"]
            .as_str()
            .map(str::to_string)
    }
}

/// `(name, value)` of every `Set-Cookie` header.
pub fn set_cookies(response: &Response) -> Vec<(String, String)> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn set_cookie_header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{}=", name)))
        .map(str::to_string)
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
