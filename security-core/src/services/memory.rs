//! In-process implementation of every persistence seam.
//!
//! Used by the test suites and by single-node deployments that do not need
//! durable state. `set_unavailable(true)` makes every call fail with
//! `StoreError::Unavailable`, which is how the fail-open and fail-closed
//! policies are exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::store::{
    AuditStore, PermissionStore, PrincipalDirectory, RateLimitStore, SessionStore, TokenStore,
    TwoFactorStore, WafStore,
};
use super::StoreError;
use crate::models::{
    AuditEvent, DirectGrant, IpBlacklistEntry, Permission, Principal, PrincipalKey,
    RateLimitEntry, RememberToken, Role, RoleAssignment, SessionState, TwoFactorSecret,
    WafLogEntry,
};

#[derive(Default)]
struct PermissionTables {
    next_permission_id: i64,
    next_role_id: i64,
    catalog: BTreeMap<i64, Permission>,
    roles: BTreeMap<i64, Role>,
    role_permissions: HashSet<(i64, i64)>,
    assignments: HashSet<RoleAssignment>,
    grants: Vec<DirectGrant>,
}

impl PermissionTables {
    fn visible_roles(&self, principal: PrincipalKey, tenant_id: Option<i64>) -> Vec<&Role> {
        self.assignments
            .iter()
            .filter(|a| a.principal() == principal)
            .filter_map(|a| self.roles.get(&a.role_id))
            .filter(|r| r.visible_in(tenant_id))
            .collect()
    }

    fn role_slugs(&self, principal: PrincipalKey, tenant_id: Option<i64>) -> HashSet<String> {
        let role_ids: HashSet<i64> = self
            .visible_roles(principal, tenant_id)
            .into_iter()
            .map(|r| r.id)
            .collect();

        self.role_permissions
            .iter()
            .filter(|(role_id, _)| role_ids.contains(role_id))
            .filter_map(|(_, permission_id)| self.catalog.get(permission_id))
            .filter(|p| p.visible_in(tenant_id))
            .map(|p| p.slug.clone())
            .collect()
    }
}

/// In-memory store backing all security components.
pub struct MemoryStore {
    unavailable: AtomicBool,
    tokens: Mutex<HashMap<String, RememberToken>>,
    sessions: Mutex<HashMap<String, (SessionState, DateTime<Utc>)>>,
    rate_limits: DashMap<String, RateLimitEntry>,
    permissions: Mutex<PermissionTables>,
    two_factor: Mutex<HashMap<PrincipalKey, TwoFactorSecret>>,
    audit: Mutex<Vec<AuditEvent>>,
    waf_events: Mutex<Vec<WafLogEntry>>,
    blacklist: Mutex<HashMap<String, IpBlacklistEntry>>,
    principals: Mutex<HashMap<PrincipalKey, Principal>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            unavailable: AtomicBool::new(false),
            tokens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            rate_limits: DashMap::new(),
            permissions: Mutex::new(PermissionTables::default()),
            two_factor: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            waf_events: Mutex::new(Vec::new()),
            blacklist: Mutex::new(HashMap::new()),
            principals: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate an unreachable backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Register a principal for `PrincipalDirectory` lookups.
    pub fn insert_principal(&self, principal: Principal) -> Result<(), StoreError> {
        lock(&self.principals, "principals")?.insert(principal.key(), principal);
        Ok(())
    }

    /// Snapshot of recorded firewall blocks, oldest first.
    pub fn waf_events(&self) -> Result<Vec<WafLogEntry>, StoreError> {
        Ok(lock(&self.waf_events, "waf_events")?.clone())
    }

    fn available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, table: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Unavailable(format!("{} mutex poisoned: {}", table, e)))
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn rotate(&self, token: &RememberToken) -> Result<(), StoreError> {
        self.available()?;
        let mut tokens = lock(&self.tokens, "tokens")?;
        let principal = token.principal();
        tokens.retain(|_, t| t.principal() != principal);
        tokens.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RememberToken>, StoreError> {
        self.available()?;
        Ok(lock(&self.tokens, "tokens")?.get(token_hash).cloned())
    }

    async fn extend(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.available()?;
        if let Some(token) = lock(&self.tokens, "tokens")?.get_mut(token_hash) {
            token.expires_at = expires_at;
            token.last_used_at = Some(used_at);
        }
        Ok(())
    }

    async fn touch(&self, token_hash: &str, used_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.available()?;
        if let Some(token) = lock(&self.tokens, "tokens")?.get_mut(token_hash) {
            token.last_used_at = Some(used_at);
        }
        Ok(())
    }

    async fn delete_for_principal(
        &self,
        principal: PrincipalKey,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        self.available()?;
        let mut tokens = lock(&self.tokens, "tokens")?;
        match tokens.get(token_hash) {
            Some(token) if token.principal() == principal => {
                tokens.remove(token_hash);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_all_for_principal(&self, principal: PrincipalKey) -> Result<u64, StoreError> {
        self.available()?;
        let mut tokens = lock(&self.tokens, "tokens")?;
        let before = tokens.len();
        tokens.retain(|_, t| t.principal() != principal);
        Ok((before - tokens.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.available()?;
        let mut tokens = lock(&self.tokens, "tokens")?;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionState>, StoreError> {
        self.available()?;
        let sessions = lock(&self.sessions, "sessions")?;
        Ok(sessions
            .get(session_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(state, _)| state.clone()))
    }

    async fn save(
        &self,
        state: &SessionState,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.sessions, "sessions")?.insert(state.id.clone(), (state.clone(), expires_at));
        Ok(())
    }

    async fn regenerate(
        &self,
        old_id: &str,
        state: &SessionState,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.available()?;
        let mut sessions = lock(&self.sessions, "sessions")?;
        sessions.insert(state.id.clone(), (state.clone(), expires_at));
        if old_id != state.id {
            sessions.remove(old_id);
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.sessions, "sessions")?.remove(session_id);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.available()?;
        let mut sessions = lock(&self.sessions, "sessions")?;
        let before = sessions.len();
        sessions.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn find(&self, identifier: &str) -> Result<Option<RateLimitEntry>, StoreError> {
        self.available()?;
        Ok(self.rate_limits.get(identifier).map(|e| e.clone()))
    }

    async fn increment(
        &self,
        identifier: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.available()?;
        // The entry guard holds the shard lock for the whole read-modify-write.
        let entry = self
            .rate_limits
            .entry(identifier.to_string())
            .and_modify(|e| {
                if e.is_expired(now) {
                    e.attempts = 1;
                    e.created_at = now;
                } else {
                    e.attempts += 1;
                }
                e.expires_at = expires_at;
            })
            .or_insert_with(|| RateLimitEntry {
                identifier: identifier.to_string(),
                attempts: 1,
                expires_at,
                created_at: now,
            });
        Ok(entry.attempts)
    }

    async fn clear(&self, identifier: &str) -> Result<(), StoreError> {
        self.available()?;
        self.rate_limits.remove(identifier);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.available()?;
        let before = self.rate_limits.len();
        self.rate_limits.retain(|_, e| !e.is_expired(now));
        Ok(before.saturating_sub(self.rate_limits.len()) as u64)
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn has_direct_grant(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        self.available()?;
        let tables = lock(&self.permissions, "permissions")?;
        Ok(tables.grants.iter().any(|g| {
            g.principal() == principal && g.permission_slug == slug && g.applies_to(tenant_id)
        }))
    }

    async fn has_role_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        self.available()?;
        let tables = lock(&self.permissions, "permissions")?;
        Ok(tables.role_slugs(principal, tenant_id).contains(slug))
    }

    async fn direct_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        self.available()?;
        let tables = lock(&self.permissions, "permissions")?;
        let slugs: HashSet<String> = tables
            .grants
            .iter()
            .filter(|g| g.principal() == principal && g.applies_to(tenant_id))
            .map(|g| g.permission_slug.clone())
            .collect();
        Ok(slugs.into_iter().collect())
    }

    async fn role_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        self.available()?;
        let tables = lock(&self.permissions, "permissions")?;
        Ok(tables.role_slugs(principal, tenant_id).into_iter().collect())
    }

    async fn principal_roles(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<Role>, StoreError> {
        self.available()?;
        let tables = lock(&self.permissions, "permissions")?;
        let mut roles: Vec<Role> = tables
            .visible_roles(principal, tenant_id)
            .into_iter()
            .cloned()
            .collect();
        roles.sort_by_key(|r| r.id);
        Ok(roles)
    }

    async fn register_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        let exists = tables.catalog.values().any(|p| {
            p.slug == permission.slug
                && p.scope == permission.scope
                && p.tenant_id == permission.tenant_id
        });
        if !exists {
            tables.next_permission_id += 1;
            let id = tables.next_permission_id;
            tables.catalog.insert(id, permission.clone());
        }
        Ok(())
    }

    async fn create_role(&self, name: &str, tenant_id: Option<i64>) -> Result<Role, StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        tables.next_role_id += 1;
        let role = Role {
            id: tables.next_role_id,
            name: name.to_string(),
            tenant_id,
        };
        tables.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn attach_permission(&self, role_id: i64, slug: &str) -> Result<(), StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        let ids: Vec<i64> = tables
            .catalog
            .iter()
            .filter(|(_, p)| p.slug == slug)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            tables.role_permissions.insert((role_id, id));
        }
        Ok(())
    }

    async fn detach_permission(&self, role_id: i64, slug: &str) -> Result<bool, StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        let ids: HashSet<i64> = tables
            .catalog
            .iter()
            .filter(|(_, p)| p.slug == slug)
            .map(|(id, _)| *id)
            .collect();
        let before = tables.role_permissions.len();
        tables
            .role_permissions
            .retain(|(r, p)| !(*r == role_id && ids.contains(p)));
        Ok(tables.role_permissions.len() < before)
    }

    async fn grant_permission(&self, grant: &DirectGrant) -> Result<(), StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        let exists = tables.grants.iter().any(|g| {
            g.principal() == grant.principal()
                && g.permission_slug == grant.permission_slug
                && g.tenant_id == grant.tenant_id
        });
        if !exists {
            tables.grants.push(grant.clone());
        }
        Ok(())
    }

    async fn revoke_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        self.available()?;
        let mut tables = lock(&self.permissions, "permissions")?;
        let before = tables.grants.len();
        tables.grants.retain(|g| {
            !(g.principal() == principal && g.permission_slug == slug && g.tenant_id == tenant_id)
        });
        Ok(tables.grants.len() < before)
    }

    async fn assign_role(&self, assignment: &RoleAssignment) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.permissions, "permissions")?
            .assignments
            .insert(assignment.clone());
        Ok(())
    }

    async fn unassign_role(&self, assignment: &RoleAssignment) -> Result<bool, StoreError> {
        self.available()?;
        Ok(lock(&self.permissions, "permissions")?
            .assignments
            .remove(assignment))
    }
}

#[async_trait]
impl TwoFactorStore for MemoryStore {
    async fn find(&self, principal: PrincipalKey) -> Result<Option<TwoFactorSecret>, StoreError> {
        self.available()?;
        Ok(lock(&self.two_factor, "two_factor")?.get(&principal).cloned())
    }

    async fn enable(&self, secret: &TwoFactorSecret) -> Result<bool, StoreError> {
        self.available()?;
        let mut rows = lock(&self.two_factor, "two_factor")?;
        if rows.contains_key(&secret.principal()) {
            return Ok(false);
        }
        rows.insert(secret.principal(), secret.clone());
        Ok(true)
    }

    async fn disable(&self, principal: PrincipalKey) -> Result<bool, StoreError> {
        self.available()?;
        Ok(lock(&self.two_factor, "two_factor")?
            .remove(&principal)
            .is_some())
    }

    async fn replace_recovery_codes(
        &self,
        principal: PrincipalKey,
        expected: &[String],
        next: &[String],
    ) -> Result<bool, StoreError> {
        self.available()?;
        let mut rows = lock(&self.two_factor, "two_factor")?;
        match rows.get_mut(&principal) {
            Some(row) if row.recovery_codes == expected => {
                row.recovery_codes = next.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_last_used(
        &self,
        principal: PrincipalKey,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.available()?;
        if let Some(row) = lock(&self.two_factor, "two_factor")?.get_mut(&principal) {
            row.last_used_at = Some(used_at);
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.audit, "audit")?.push(event.clone());
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.available()?;
        let mut events = lock(&self.audit, "audit")?;
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError> {
        self.available()?;
        let events = lock(&self.audit, "audit")?;
        // Reversed first so equal timestamps keep newest-inserted first
        let mut newest: Vec<AuditEvent> = events.iter().rev().cloned().collect();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        newest.truncate(limit.max(0) as usize);
        Ok(newest)
    }
}

#[async_trait]
impl WafStore for MemoryStore {
    async fn record_event(&self, entry: &WafLogEntry) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.waf_events, "waf_events")?.push(entry.clone());
        Ok(())
    }

    async fn is_blacklisted(&self, ip: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.available()?;
        Ok(lock(&self.blacklist, "blacklist")?
            .get(ip)
            .is_some_and(|e| e.is_active(now)))
    }

    async fn blacklist(&self, entry: &IpBlacklistEntry) -> Result<(), StoreError> {
        self.available()?;
        lock(&self.blacklist, "blacklist")?.insert(entry.ip_address.clone(), entry.clone());
        Ok(())
    }

    async fn count_recent_events(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.available()?;
        let events = lock(&self.waf_events, "waf_events")?;
        Ok(events
            .iter()
            .filter(|e| e.ip_address == ip && e.created_at >= since)
            .count() as u64)
    }

    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.available()?;
        let mut entries = lock(&self.blacklist, "blacklist")?;
        let before = entries.len();
        entries.retain(|_, e| e.is_active(now));
        Ok((before - entries.len()) as u64)
    }
}

#[async_trait]
impl PrincipalDirectory for MemoryStore {
    async fn find_principal(&self, key: PrincipalKey) -> Result<Option<Principal>, StoreError> {
        self.available()?;
        Ok(lock(&self.principals, "principals")?.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PermissionScope, PrincipalType};
    use chrono::Duration;

    fn user(id: i64) -> PrincipalKey {
        PrincipalKey {
            principal_type: PrincipalType::User,
            principal_id: id,
        }
    }

    #[tokio::test]
    async fn test_rotate_keeps_single_token_per_principal() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (_, first) = RememberToken::issue(user(1), Duration::days(30), None, None, now);
        let (_, second) = RememberToken::issue(user(1), Duration::days(30), None, None, now);
        let (_, other) = RememberToken::issue(user(2), Duration::days(30), None, None, now);

        store.rotate(&first).await.unwrap();
        store.rotate(&other).await.unwrap();
        store.rotate(&second).await.unwrap();

        assert!(store.find_by_hash(&first.token_hash).await.unwrap().is_none());
        assert!(store.find_by_hash(&second.token_hash).await.unwrap().is_some());
        assert!(store.find_by_hash(&other.token_hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_for_principal_requires_owner() {
        let store = MemoryStore::new();
        let (_, token) = RememberToken::issue(user(1), Duration::days(30), None, None, Utc::now());
        store.rotate(&token).await.unwrap();

        assert!(!store.delete_for_principal(user(2), &token.token_hash).await.unwrap());
        assert!(store.delete_for_principal(user(1), &token.token_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(store.increment("k", now + Duration::minutes(1), now).await.unwrap(), 1);
        assert_eq!(store.increment("k", now + Duration::minutes(1), now).await.unwrap(), 2);

        let later = now + Duration::minutes(2);
        assert_eq!(store.increment("k", later + Duration::minutes(1), later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_moves_session() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut state = SessionState::new(now);
        let expires = now + Duration::hours(1);
        store.save(&state, expires).await.unwrap();

        let old_id = state.id.clone();
        state.id = crate::models::random_token();
        store.regenerate(&old_id, &state, expires).await.unwrap();

        assert!(store.load(&old_id, now).await.unwrap().is_none());
        assert_eq!(store.load(&state.id, now).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_role_permission_respects_tenant_visibility() {
        let store = MemoryStore::new();
        store
            .register_permission(&Permission::new("blog.edit", "blog", PermissionScope::Tenant).for_tenant(5))
            .await
            .unwrap();
        let role = store.create_role("editor", None).await.unwrap();
        store.attach_permission(role.id, "blog.edit").await.unwrap();
        store.assign_role(&RoleAssignment::new(role.id, user(1))).await.unwrap();

        assert!(store.has_role_permission(user(1), "blog.edit", Some(5)).await.unwrap());
        assert!(!store.has_role_permission(user(1), "blog.edit", Some(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            RateLimitStore::find(&store, "anything").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(RateLimitStore::find(&store, "anything").await.unwrap().is_none());
    }
}
