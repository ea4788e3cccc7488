//! Audit event model - append-only security log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Principal, PrincipalType};

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    Logout,
    PasswordChange,
    RoleChange,
    PermissionChange,
    AccessDenied,
    CsrfViolation,
    RateLimitExceeded,
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorFailure,
    RecoveryCodeUsed,
    SessionRestored,
    SessionExpired,
    WafBlock,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSuccess => "login_success",
            AuditEventType::LoginFailure => "login_failure",
            AuditEventType::Logout => "logout",
            AuditEventType::PasswordChange => "password_change",
            AuditEventType::RoleChange => "role_change",
            AuditEventType::PermissionChange => "permission_change",
            AuditEventType::AccessDenied => "access_denied",
            AuditEventType::CsrfViolation => "csrf_violation",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::TwoFactorEnabled => "two_factor_enabled",
            AuditEventType::TwoFactorDisabled => "two_factor_disabled",
            AuditEventType::TwoFactorFailure => "two_factor_failure",
            AuditEventType::RecoveryCodeUsed => "recovery_code_used",
            AuditEventType::SessionRestored => "session_restored",
            AuditEventType::SessionExpired => "session_expired",
            AuditEventType::WafBlock => "waf_block",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Who acted, frozen at the time of the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSnapshot {
    pub principal_id: i64,
    pub principal_type: PrincipalType,
    pub email: String,
    pub role: Option<String>,
}

impl From<&Principal> for PrincipalSnapshot {
    fn from(p: &Principal) -> Self {
        Self {
            principal_id: p.id,
            principal_type: p.principal_type,
            email: p.email.clone(),
            role: p.role.clone(),
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    /// Stored as text so new event kinds never need a schema change.
    pub event_type: String,
    pub severity: Severity,
    pub principal: Option<PrincipalSnapshot>,
    pub tenant_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub uri: Option<String>,
    pub method: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: &str, severity: Severity, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            severity,
            principal: None,
            tenant_id: None,
            ip_address: None,
            user_agent: None,
            uri: None,
            method: None,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(AuditEventType::LoginFailure.as_str(), "login_failure");
        assert_eq!(AuditEventType::CsrfViolation.to_string(), "csrf_violation");
        let json = serde_json::to_string(&AuditEventType::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"rate_limit_exceeded\"");
    }

    #[test]
    fn test_severity_ordering_and_names() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"WARNING\"");
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("critical".parse::<Severity>().is_err());
    }
}
