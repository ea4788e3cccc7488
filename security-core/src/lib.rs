//! Security core of the multi-tenant CMS: sessions with remember-me
//! restoration, tenant-scoped permission resolution, rate limiting, a
//! pattern-matching firewall, TOTP two-factor authentication and an audit log.

pub mod config;
pub mod context;
pub mod db;
pub mod maintenance;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;
pub mod waf;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use service_core::middleware::{request_id_middleware, security_headers_middleware, SecurityHeaders};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SecurityConfig;
use crate::services::{
    AuditLogger, AuditStore, Database, MemoryStore, PermissionResolver, PermissionStore,
    PrincipalDirectory, RateLimitStore, RateLimiter, SessionManager, SessionStore, TokenStore,
    TwoFactorAuth, TwoFactorStore, WafStore,
};
use crate::waf::Firewall;

/// Every component, wired once at startup and cloned into request handlers.
#[derive(Clone)]
pub struct SecurityCore {
    pub config: Arc<SecurityConfig>,
    pub sessions: SessionManager,
    pub permissions: PermissionResolver,
    pub rate_limiter: RateLimiter,
    pub firewall: Firewall,
    pub two_factor: TwoFactorAuth,
    pub audit: AuditLogger,
}

impl SecurityCore {
    /// Wire all components over one store. `directory` resolves principals
    /// when a remember token restores a session.
    pub fn new<S>(config: SecurityConfig, store: Arc<S>, directory: Arc<dyn PrincipalDirectory>) -> Self
    where
        S: TokenStore
            + SessionStore
            + RateLimitStore
            + PermissionStore
            + TwoFactorStore
            + AuditStore
            + WafStore
            + 'static,
    {
        let audit = AuditLogger::new(store.clone());

        Self {
            sessions: SessionManager::new(
                store.clone(),
                store.clone(),
                directory,
                audit.clone(),
                config.session.clone(),
            ),
            permissions: PermissionResolver::new(store.clone(), audit.clone()),
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.clone()),
            firewall: Firewall::new(store.clone(), audit.clone(), config.waf.clone()),
            two_factor: TwoFactorAuth::new(store, &config.two_factor),
            audit,
            config: Arc::new(config),
        }
    }

    pub fn with_database(
        config: SecurityConfig,
        db: Database,
        directory: Arc<dyn PrincipalDirectory>,
    ) -> Self {
        Self::new(config, Arc::new(db), directory)
    }

    /// Single-process setup backed by [`MemoryStore`], which also serves as
    /// the principal directory.
    pub fn in_memory(config: SecurityConfig) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let core = Self::new(config, store.clone(), store.clone());
        (core, store)
    }
}

/// Wrap `router` in the security stack. Outermost first: security headers,
/// request id, tracing, firewall, session, CSRF.
pub fn apply_security_layers(router: Router, core: SecurityCore) -> Router {
    let headers = if core.config.session.cookie_secure {
        SecurityHeaders::default()
    } else {
        SecurityHeaders::default().without_hsts()
    };

    router
        .layer(from_fn_with_state(
            core.clone(),
            middleware::csrf_middleware,
        ))
        .layer(from_fn_with_state(
            core.clone(),
            middleware::session_middleware,
        ))
        .layer(from_fn_with_state(
            core.firewall.clone(),
            middleware::waf_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
        .layer(from_fn_with_state(
            Arc::new(headers),
            security_headers_middleware,
        ))
}
