//! Security audit log.
//!
//! Every event goes to the `security_audit` tracing target first (the file
//! sink configured by `init_tracing`), then to the audit store. A failed store
//! write is reported through the return value and never propagates.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use super::store::AuditStore;
use super::ServiceError;
use crate::context::RequestContext;
use crate::models::{
    AuditEvent, AuditEventType, Principal, PrincipalKey, PrincipalSnapshot, SessionState,
    Severity, ThreatKind,
};

/// Tracing target of the redundant audit sink.
pub const AUDIT_TARGET: &str = "security_audit";

/// Ambient data attached to every event: who, where, which request.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub request: RequestContext,
    pub principal: Option<PrincipalSnapshot>,
    pub tenant_id: Option<i64>,
}

impl AuditContext {
    pub fn new(request: RequestContext) -> Self {
        Self {
            request,
            principal: None,
            tenant_id: None,
        }
    }

    /// Principal and tenant of the session's authenticated identity, if any.
    pub fn from_session(request: &RequestContext, session: &SessionState) -> Self {
        let mut ctx = Self::new(request.clone());
        if let Some(principal) = &session.principal {
            ctx = ctx.with_principal(principal);
        }
        ctx
    }

    pub fn with_principal(mut self, principal: &Principal) -> Self {
        self.principal = Some(PrincipalSnapshot::from(principal));
        self.tenant_id = principal.tenant_id;
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<i64>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Record an event. Returns `false` when the structured write failed; the
    /// tracing record has been emitted either way.
    pub async fn log(
        &self,
        ctx: &AuditContext,
        event_type: &str,
        severity: Severity,
        data: serde_json::Value,
    ) -> bool {
        let mut event = AuditEvent::new(event_type, severity, data);
        event.principal = ctx.principal.clone();
        event.tenant_id = ctx.tenant_id;
        event.ip_address = Some(ctx.request.ip_address.clone());
        event.user_agent = ctx.request.user_agent.clone();
        event.uri = Some(ctx.request.uri.clone());
        event.method = Some(ctx.request.method.clone());

        emit(&event, ctx.request.request_id.as_deref());

        match self.store.insert(&event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    target: AUDIT_TARGET,
                    error = %e,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Failed to persist audit event"
                );
                false
            }
        }
    }

    async fn log_typed(
        &self,
        ctx: &AuditContext,
        event_type: AuditEventType,
        severity: Severity,
        data: serde_json::Value,
    ) -> bool {
        self.log(ctx, event_type.as_str(), severity, data).await
    }

    pub async fn login_success(&self, ctx: &AuditContext, remember: bool) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::LoginSuccess,
            Severity::Info,
            json!({ "remember": remember }),
        )
        .await
    }

    /// `identifier` is whatever the caller tried to log in as. The reason is
    /// stored for operators only and never shown to the client.
    pub async fn login_failure(&self, ctx: &AuditContext, identifier: &str, reason: &str) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::LoginFailure,
            Severity::Warning,
            json!({ "identifier": identifier, "reason": reason }),
        )
        .await
    }

    pub async fn logout(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::Logout, Severity::Info, json!({}))
            .await
    }

    pub async fn password_change(&self, ctx: &AuditContext, target: PrincipalKey) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::PasswordChange,
            Severity::Warning,
            json!({ "target": target.to_string() }),
        )
        .await
    }

    pub async fn role_change(
        &self,
        ctx: &AuditContext,
        target: PrincipalKey,
        role_id: i64,
        action: &str,
    ) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::RoleChange,
            Severity::Warning,
            json!({ "target": target.to_string(), "role_id": role_id, "action": action }),
        )
        .await
    }

    pub async fn permission_change(
        &self,
        ctx: &AuditContext,
        target: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
        action: &str,
    ) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::PermissionChange,
            Severity::Warning,
            json!({
                "target": target.to_string(),
                "permission": slug,
                "tenant_id": tenant_id,
                "action": action,
            }),
        )
        .await
    }

    pub async fn access_denied(
        &self,
        ctx: &AuditContext,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::AccessDenied,
            Severity::Warning,
            json!({ "permission": slug, "tenant_id": tenant_id }),
        )
        .await
    }

    pub async fn csrf_violation(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::CsrfViolation, Severity::Critical, json!({}))
            .await
    }

    pub async fn rate_limit_exceeded(&self, ctx: &AuditContext, identifier: &str) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::RateLimitExceeded,
            Severity::Warning,
            json!({ "identifier": identifier }),
        )
        .await
    }

    pub async fn two_factor_enabled(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::TwoFactorEnabled, Severity::Info, json!({}))
            .await
    }

    pub async fn two_factor_disabled(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::TwoFactorDisabled, Severity::Warning, json!({}))
            .await
    }

    pub async fn two_factor_failure(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::TwoFactorFailure, Severity::Warning, json!({}))
            .await
    }

    pub async fn recovery_code_used(&self, ctx: &AuditContext, remaining: usize) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::RecoveryCodeUsed,
            Severity::Warning,
            json!({ "remaining": remaining }),
        )
        .await
    }

    pub async fn session_restored(&self, ctx: &AuditContext) -> bool {
        self.log_typed(ctx, AuditEventType::SessionRestored, Severity::Info, json!({}))
            .await
    }

    pub async fn session_expired(&self, ctx: &AuditContext, idle_seconds: Option<i64>) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::SessionExpired,
            Severity::Info,
            json!({ "idle_seconds": idle_seconds }),
        )
        .await
    }

    pub async fn waf_block(
        &self,
        ctx: &AuditContext,
        threat: ThreatKind,
        source: &str,
        reference: &str,
    ) -> bool {
        self.log_typed(
            ctx,
            AuditEventType::WafBlock,
            Severity::Critical,
            json!({ "threat": threat.as_str(), "source": source, "reference": reference }),
        )
        .await
    }

    /// Delete events older than `retention_days`. Returns the number removed.
    /// A retention that is not positive or does not fit a timestamp is refused.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64, ServiceError> {
        self.cleanup_at(retention_days, Utc::now()).await
    }

    pub async fn cleanup_at(
        &self,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let cutoff = Duration::try_days(retention_days)
            .filter(|_| retention_days > 0)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or(ServiceError::InvalidRetention(retention_days))?;
        let removed = self.store.delete_older_than(cutoff).await?;
        tracing::info!(target: AUDIT_TARGET, removed, retention_days, "Audit log cleanup");
        Ok(removed)
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, ServiceError> {
        Ok(self.store.recent(limit).await?)
    }
}

fn emit(event: &AuditEvent, request_id: Option<&str>) {
    let principal_id = event.principal.as_ref().map(|p| p.principal_id);
    let principal_type = event.principal.as_ref().map(|p| p.principal_type.as_str());

    macro_rules! record {
        ($level:ident) => {
            tracing::$level!(
                target: AUDIT_TARGET,
                event_id = %event.event_id,
                event_type = %event.event_type,
                severity = event.severity.as_str(),
                principal_id,
                principal_type,
                tenant_id = event.tenant_id,
                ip_address = event.ip_address.as_deref(),
                user_agent = event.user_agent.as_deref(),
                uri = event.uri.as_deref(),
                method = event.method.as_deref(),
                request_id,
                payload = %event.payload,
                "Security event"
            )
        };
    }

    match event.severity {
        Severity::Info => record!(info),
        Severity::Warning => record!(warn),
        Severity::Critical => record!(error),
    }
}
