use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::context::RequestContext;
use crate::models::Principal;
use crate::services::{csrf, ActiveSession, AuditContext};
use crate::SecurityCore;

/// Shared handle to the request's session. Handlers lock it to read the
/// principal or to call `SessionManager` operations; the middleware persists
/// whatever state it holds once the handler returns.
#[derive(Clone)]
pub struct CurrentSession {
    inner: Arc<Mutex<ActiveSession>>,
    remember_token: Option<String>,
    request: RequestContext,
}

impl CurrentSession {
    pub fn new(session: ActiveSession, remember_token: Option<String>, request: RequestContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            remember_token,
            request,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ActiveSession> {
        self.inner.lock().await
    }

    pub async fn principal(&self) -> Option<Principal> {
        self.inner.lock().await.principal().cloned()
    }

    pub async fn csrf_token(&self) -> String {
        self.inner.lock().await.state.csrf_token.clone()
    }

    /// Raw remember token presented with the request, needed for logout.
    pub fn remember_token(&self) -> Option<&str> {
        self.remember_token.as_deref()
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    async fn snapshot(&self) -> ActiveSession {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<CurrentSession>().cloned().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Session missing from request extensions"))
        })
    }
}

/// Load the session, run the activity check, hand the session to the handler
/// and write it back with its cookies afterwards.
pub async fn session_middleware(
    State(core): State<SecurityCore>,
    mut req: Request,
    next: Next,
) -> Response {
    let manager = &core.sessions;
    let config = manager.config();
    let now = Utc::now();

    let jar = CookieJar::from_headers(req.headers());
    let session_id = jar.get(&config.cookie_name).map(|c| c.value().to_string());
    let remember = jar
        .get(&config.remember_cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());

    let ctx = RequestContext::from_request(&req);
    let mut session = manager.load(session_id.as_deref(), now).await;
    let status = manager
        .check_activity_at(&mut session, remember.as_deref(), &ctx, now)
        .await;
    tracing::debug!(?status, "Session checked");

    let handle = CurrentSession::new(session, remember, ctx);
    req.extensions_mut().insert(handle.clone());

    let response = next.run(req).await;

    let session = handle.snapshot().await;
    manager.persist(&session, Utc::now()).await;
    let jar = manager.apply_cookies(&session, CookieJar::new());

    (jar, response).into_response()
}

/// Reject state-changing requests whose `x-csrf-token` header does not match
/// the session token. Must run inside [`session_middleware`].
pub async fn csrf_middleware(State(core): State<SecurityCore>, req: Request, next: Next) -> Response {
    if !csrf::requires_verification(req.method()) {
        return next.run(req).await;
    }

    let Some(handle) = req.extensions().get::<CurrentSession>().cloned() else {
        return AppError::InternalError(anyhow::anyhow!("CSRF check without a session"))
            .into_response();
    };

    let submitted = req
        .headers()
        .get(csrf::CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let violation = {
        let session = handle.lock().await;
        match csrf::verify(&session.state, submitted.as_deref()) {
            Ok(()) => None,
            Err(e) => Some((AuditContext::from_session(handle.request(), &session.state), e)),
        }
    };

    match violation {
        None => next.run(req).await,
        Some((ctx, e)) => {
            tracing::warn!(ip = %ctx.request.ip_address, uri = %ctx.request.uri, "CSRF token mismatch");
            core.audit.csrf_violation(&ctx).await;
            AppError::from(e).into_response()
        }
    }
}
