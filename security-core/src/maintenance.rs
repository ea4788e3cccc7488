//! Periodic cleanup, triggered externally (cron) through the CLI.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::services::{
    AuditLogger, AuditStore, RateLimitStore, ServiceError, SessionStore, TokenStore, WafStore,
};

/// Rows removed by one cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub audit_events: u64,
    pub remember_tokens: u64,
    pub sessions: u64,
    pub rate_limits: u64,
    pub blacklist_entries: u64,
}

/// Purge expired tokens, sessions, rate limit rows and blacklist entries, and
/// audit events older than `retention_days`. Safe to run alongside traffic:
/// every step is a single conditional delete.
pub async fn cleanup<S>(
    store: Arc<S>,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<CleanupReport, ServiceError>
where
    S: TokenStore + SessionStore + RateLimitStore + AuditStore + WafStore + 'static,
{
    let report = CleanupReport {
        audit_events: AuditLogger::new(store.clone())
            .cleanup_at(retention_days, now)
            .await?,
        remember_tokens: TokenStore::purge_expired(store.as_ref(), now).await?,
        sessions: SessionStore::purge_expired(store.as_ref(), now).await?,
        rate_limits: RateLimitStore::purge_expired(store.as_ref(), now).await?,
        blacklist_entries: store.purge_expired_blacklist(now).await?,
    };

    tracing::info!(
        audit_events = report.audit_events,
        remember_tokens = report.remember_tokens,
        sessions = report.sessions,
        rate_limits = report.rate_limits,
        blacklist_entries = report.blacklist_entries,
        "Cleanup finished"
    );
    Ok(report)
}
