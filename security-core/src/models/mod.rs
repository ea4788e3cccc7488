pub mod audit_event;
pub mod permission;
pub mod principal;
pub mod rate_limit;
pub mod remember_token;
pub mod session;
pub mod two_factor;
pub mod waf;

pub use audit_event::{AuditEvent, AuditEventType, PrincipalSnapshot, Severity};
pub use permission::{
    DirectGrant, EffectivePermissions, Permission, PermissionScope, Role, RoleAssignment,
};
pub use principal::{Principal, PrincipalKey, PrincipalType};
pub use rate_limit::RateLimitEntry;
pub use remember_token::{hash_token, RememberToken};
pub use session::{random_token, SessionState};
pub use two_factor::TwoFactorSecret;
pub use waf::{IpBlacklistEntry, ThreatKind, WafLogEntry};
