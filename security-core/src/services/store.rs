//! Persistence seams.
//!
//! Each component talks to storage only through one of these traits. Two
//! implementations exist: [`Database`](super::Database) over PostgreSQL and
//! [`MemoryStore`](super::MemoryStore) for tests and single-process setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::StoreError;
use crate::models::{
    AuditEvent, DirectGrant, IpBlacklistEntry, Permission, Principal, PrincipalKey,
    RateLimitEntry, RememberToken, Role, RoleAssignment, SessionState, TwoFactorSecret,
    WafLogEntry,
};

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Delete every token of the principal and insert `token` in a single
    /// transaction.
    async fn rotate(&self, token: &RememberToken) -> Result<(), StoreError>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RememberToken>, StoreError>;

    /// Push the expiry forward without minting a new raw token.
    async fn extend(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn touch(&self, token_hash: &str, used_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete the token only when it belongs to `principal`.
    async fn delete_for_principal(
        &self,
        principal: PrincipalKey,
        token_hash: &str,
    ) -> Result<bool, StoreError>;

    async fn delete_all_for_principal(&self, principal: PrincipalKey) -> Result<u64, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a live session; rows past their expiry are treated as absent.
    async fn load(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionState>, StoreError>;

    async fn save(&self, state: &SessionState, expires_at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Move the data stored under `old_id` to `state.id` atomically.
    async fn regenerate(
        &self,
        old_id: &str,
        state: &SessionState,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn find(&self, identifier: &str) -> Result<Option<RateLimitEntry>, StoreError>;

    /// Atomic insert-or-increment. An expired row restarts at one. Returns the
    /// attempt count after the increment.
    async fn increment(
        &self,
        identifier: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    async fn clear(&self, identifier: &str) -> Result<(), StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Direct grant for `slug` whose tenant matches exactly or is global.
    async fn has_direct_grant(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError>;

    /// Role-inherited `slug`, honouring role and permission tenant visibility.
    async fn has_role_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError>;

    async fn direct_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError>;

    async fn role_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError>;

    async fn principal_roles(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<Role>, StoreError>;

    async fn register_permission(&self, permission: &Permission) -> Result<(), StoreError>;

    async fn create_role(&self, name: &str, tenant_id: Option<i64>) -> Result<Role, StoreError>;

    async fn attach_permission(&self, role_id: i64, slug: &str) -> Result<(), StoreError>;

    async fn detach_permission(&self, role_id: i64, slug: &str) -> Result<bool, StoreError>;

    async fn grant_permission(&self, grant: &DirectGrant) -> Result<(), StoreError>;

    async fn revoke_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError>;

    async fn assign_role(&self, assignment: &RoleAssignment) -> Result<(), StoreError>;

    async fn unassign_role(&self, assignment: &RoleAssignment) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TwoFactorStore: Send + Sync {
    async fn find(&self, principal: PrincipalKey) -> Result<Option<TwoFactorSecret>, StoreError>;

    /// Insert the full configuration; `false` when one already exists.
    async fn enable(&self, secret: &TwoFactorSecret) -> Result<bool, StoreError>;

    async fn disable(&self, principal: PrincipalKey) -> Result<bool, StoreError>;

    /// Compare-and-swap of the recovery code list. `false` when the stored
    /// list no longer equals `expected` (a concurrent consumer won).
    async fn replace_recovery_codes(
        &self,
        principal: PrincipalKey,
        expected: &[String],
        next: &[String],
    ) -> Result<bool, StoreError>;

    async fn touch_last_used(
        &self,
        principal: PrincipalKey,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError>;
}

#[async_trait]
pub trait WafStore: Send + Sync {
    async fn record_event(&self, entry: &WafLogEntry) -> Result<(), StoreError>;

    async fn is_blacklisted(&self, ip: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Insert or replace the entry for its IP.
    async fn blacklist(&self, entry: &IpBlacklistEntry) -> Result<(), StoreError>;

    async fn count_recent_events(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Lookup of principals by key, implemented by the CMS user tables.
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn find_principal(&self, key: PrincipalKey) -> Result<Option<Principal>, StoreError>;
}
