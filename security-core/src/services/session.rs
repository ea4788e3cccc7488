//! Session lifecycle: login, inactivity timeout, fixation-safe regeneration,
//! remember-me restoration and logout.
//!
//! All operations work on an explicit [`ActiveSession`] owned by the request.
//! Cookie changes accumulate on it and are applied to the response jar by
//! [`SessionManager::apply_cookies`].

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::audit::{AuditContext, AuditLogger};
use super::store::{PrincipalDirectory, SessionStore, TokenStore};
use super::{csrf, ServiceError, StoreError};
use crate::config::SessionConfig;
use crate::context::RequestContext;
use crate::models::{hash_token, random_token, Principal, RememberToken, SessionState};

/// Pending change to the remember-me cookie.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RememberCookie {
    #[default]
    Unchanged,
    Set(String),
    Clear,
}

/// Result of the per-request activity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Active,
    /// Identifier rotated on schedule; contents preserved.
    Regenerated,
    /// Identity re-established from a remember token.
    Restored,
    /// Idle limit exceeded and no token could restore it.
    Expired,
}

/// Session state plus the side effects a request accumulated on it.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub state: SessionState,
    /// Identifier the session was loaded under, `None` for new sessions.
    loaded_id: Option<String>,
    remember: RememberCookie,
}

impl ActiveSession {
    pub fn new(state: SessionState, loaded_id: Option<String>) -> Self {
        Self {
            state,
            loaded_id,
            remember: RememberCookie::Unchanged,
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.state.principal.as_ref()
    }

    pub fn remember_cookie(&self) -> &RememberCookie {
        &self.remember
    }

    /// True when the identifier differs from the one the request arrived with.
    pub fn id_changed(&self) -> bool {
        self.loaded_id.as_deref() != Some(self.state.id.as_str())
    }

    fn rotate_id(&mut self, now: DateTime<Utc>) {
        self.state.id = random_token();
        self.state.regenerated_at = now;
    }
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenStore>,
    directory: Arc<dyn PrincipalDirectory>,
    audit: AuditLogger,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenStore>,
        directory: Arc<dyn PrincipalDirectory>,
        audit: AuditLogger,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions,
            tokens,
            directory,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn idle_limit(&self, persistent: bool) -> i64 {
        if persistent {
            self.config.persistent_idle_timeout_seconds
        } else {
            self.config.idle_timeout_seconds
        }
    }

    fn remember_lifetime(&self) -> Duration {
        Duration::days(self.config.remember_lifetime_days)
    }

    /// Load the session named by the cookie, or start a fresh anonymous one.
    /// A store failure yields a fresh session.
    pub async fn load(&self, session_id: Option<&str>, now: DateTime<Utc>) -> ActiveSession {
        let Some(id) = session_id.filter(|id| !id.is_empty()) else {
            return ActiveSession::new(SessionState::new(now), None);
        };

        match self.sessions.load(id, now).await {
            Ok(Some(state)) => ActiveSession::new(state, Some(id.to_string())),
            Ok(None) => ActiveSession::new(SessionState::new(now), None),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load session, starting a new one");
                ActiveSession::new(SessionState::new(now), None)
            }
        }
    }

    /// Per-request check: inactivity timeout, restoration, scheduled
    /// regeneration and activity recording.
    pub async fn check_activity(
        &self,
        session: &mut ActiveSession,
        remember_token: Option<&str>,
        request: &RequestContext,
    ) -> SessionStatus {
        self.check_activity_at(session, remember_token, request, Utc::now())
            .await
    }

    pub async fn check_activity_at(
        &self,
        session: &mut ActiveSession,
        remember_token: Option<&str>,
        request: &RequestContext,
        now: DateTime<Utc>,
    ) -> SessionStatus {
        if !session.state.is_authenticated() {
            if let Some(raw) = remember_token {
                if self.restore(session, raw, request, now).await {
                    return SessionStatus::Restored;
                }
                session.remember = RememberCookie::Clear;
            }
            return SessionStatus::Anonymous;
        }

        let limit = self.idle_limit(session.state.persistent);
        if let Some(idle) = session.state.idle_seconds(now).filter(|idle| *idle > limit) {
            tracing::info!(idle_seconds = idle, limit, "Session idle limit exceeded");

            if let Some(raw) = remember_token {
                if self.restore(session, raw, request, now).await {
                    return SessionStatus::Restored;
                }
            }

            let ctx = AuditContext::from_session(request, &session.state);
            self.audit.session_expired(&ctx, Some(idle)).await;
            self.hard_destroy(session, now);
            return SessionStatus::Expired;
        }

        let mut status = SessionStatus::Active;
        if session.state.seconds_since_regeneration(now) >= self.config.regenerate_interval_seconds {
            session.rotate_id(now);
            tracing::debug!("Session identifier regenerated");
            status = SessionStatus::Regenerated;
        }

        session.state.last_active_at = Some(now);
        status
    }

    /// Re-establish identity from a raw remember token. CSRF token and
    /// creation time survive; the identifier is rotated. Any failure means
    /// "not authenticated".
    async fn restore(
        &self,
        session: &mut ActiveSession,
        raw: &str,
        request: &RequestContext,
        now: DateTime<Utc>,
    ) -> bool {
        let token_hash = hash_token(raw);

        let token = match self.tokens.find_by_hash(&token_hash).await {
            Ok(Some(token)) if !token.is_expired(now) => token,
            Ok(_) => {
                tracing::debug!("Remember token unknown or expired");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remember token lookup failed");
                return false;
            }
        };

        let principal = match self.directory.find_principal(token.principal()).await {
            Ok(Some(principal)) => principal,
            Ok(None) => {
                tracing::warn!(principal = %token.principal(), "Remember token for unknown principal");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Principal lookup failed during restoration");
                return false;
            }
        };

        let refresh_window = Duration::days(self.config.remember_refresh_days);
        let token_update = if token.needs_refresh(refresh_window, now) {
            self.tokens
                .extend(&token_hash, now + self.remember_lifetime(), now)
                .await
        } else {
            self.tokens.touch(&token_hash, now).await
        };
        if let Err(e) = token_update {
            tracing::warn!(error = %e, "Failed to update remember token usage");
        }

        let state = &mut session.state;
        state.principal = Some(principal.clone());
        state.pending_two_factor = None;
        state.persistent = true;
        state.last_active_at = Some(now);
        session.rotate_id(now);

        let ctx = AuditContext::new(request.clone()).with_principal(&principal);
        self.audit.session_restored(&ctx).await;
        tracing::info!(principal = %principal.key(), "Session restored from remember token");
        true
    }

    /// Authenticate the session as `principal`. The identifier and CSRF token
    /// are rotated; `remember` additionally mints a remember token.
    #[tracing::instrument(skip(self, session, principal, request), fields(principal = %principal.key()))]
    pub async fn login(
        &self,
        session: &mut ActiveSession,
        principal: Principal,
        remember: bool,
        request: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.login_at(session, principal, remember, request, Utc::now())
            .await
    }

    pub async fn login_at(
        &self,
        session: &mut ActiveSession,
        principal: Principal,
        remember: bool,
        request: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        session.rotate_id(now);
        csrf::rotate(&mut session.state);

        let state = &mut session.state;
        state.principal = Some(principal);
        state.pending_two_factor = None;
        state.persistent = false;
        state.last_active_at = Some(now);

        if remember {
            self.remember_at(session, request, now).await?;
        }
        Ok(())
    }

    /// Mint a remember token for the authenticated principal, replacing any
    /// earlier token of that principal, and mark the session persistent.
    pub async fn remember_at(
        &self,
        session: &mut ActiveSession,
        request: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let key = session
            .principal()
            .map(Principal::key)
            .ok_or(ServiceError::NotAuthenticated)?;

        let (raw, token) = RememberToken::issue(
            key,
            self.remember_lifetime(),
            Some(request.ip_address.clone()),
            request.user_agent.clone(),
            now,
        );
        self.tokens.rotate(&token).await?;

        session.state.persistent = true;
        session.remember = RememberCookie::Set(raw);
        tracing::debug!(principal = %key, "Remember token issued");
        Ok(())
    }

    /// Explicit logout. The remember token row is deleted only when the
    /// presented token belongs to the session's principal.
    pub async fn destroy(&self, session: &mut ActiveSession, remember_token: Option<&str>) {
        self.destroy_at(session, remember_token, Utc::now()).await
    }

    pub async fn destroy_at(
        &self,
        session: &mut ActiveSession,
        remember_token: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if let (Some(principal), Some(raw)) = (session.principal(), remember_token) {
            let key = principal.key();
            if let Err(e) = self.tokens.delete_for_principal(key, &hash_token(raw)).await {
                tracing::error!(error = %e, principal = %key, "Failed to delete remember token");
            }
        }
        self.hard_destroy(session, now);
    }

    /// Invalidate every remember token of the principal, e.g. after a
    /// password change.
    pub async fn forget_everywhere(&self, session: &ActiveSession) -> Result<u64, ServiceError> {
        let key = session
            .principal()
            .map(Principal::key)
            .ok_or(ServiceError::NotAuthenticated)?;
        Ok(self.tokens.delete_all_for_principal(key).await?)
    }

    fn hard_destroy(&self, session: &mut ActiveSession, now: DateTime<Utc>) {
        session.state.clear(now);
        session.remember = RememberCookie::Clear;
    }

    /// Write the session back. Moves the row when the identifier changed.
    /// Failures are logged and reported as `false`.
    pub async fn persist(&self, session: &ActiveSession, now: DateTime<Utc>) -> bool {
        let since = session.state.last_active_at.unwrap_or(now);
        let expires_at = since + Duration::seconds(self.idle_limit(session.state.persistent));

        let result = match session.loaded_id.as_deref() {
            Some(old_id) if session.id_changed() => {
                self.sessions
                    .regenerate(old_id, &session.state, expires_at)
                    .await
            }
            _ => self.sessions.save(&session.state, expires_at).await,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist session");
                false
            }
        }
    }

    /// Delete expired sessions and remember tokens.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let sessions = self.sessions.purge_expired(now).await?;
        let tokens = self.tokens.purge_expired(now).await?;
        Ok((sessions, tokens))
    }

    pub fn session_cookie(&self, id: &str) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.config.cookie_name.clone(), id.to_string()))
            .path("/")
            .http_only(true)
            .secure(self.config.cookie_secure)
            .same_site(SameSite::Strict)
            .build();
        if let Some(domain) = &self.config.cookie_domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    pub fn remember_cookie(&self, raw: &str) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.config.remember_cookie_name.clone(), raw.to_string()))
            .path("/")
            .http_only(true)
            .secure(self.config.cookie_secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::days(self.config.remember_lifetime_days))
            .build();
        if let Some(domain) = &self.config.cookie_domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    /// Add the session cookie and any pending remember cookie change.
    pub fn apply_cookies(&self, session: &ActiveSession, jar: CookieJar) -> CookieJar {
        let jar = jar.add(self.session_cookie(&session.state.id));
        match &session.remember {
            RememberCookie::Unchanged => jar,
            RememberCookie::Set(raw) => jar.add(self.remember_cookie(raw)),
            RememberCookie::Clear => {
                // Written out explicitly: `CookieJar::remove` only emits a
                // removal for cookies the jar was built from.
                let mut removal = self.remember_cookie("");
                removal.make_removal();
                jar.add(removal)
            }
        }
    }
}
