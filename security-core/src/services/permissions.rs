//! Permission resolution: root bypass, then direct grants, then role-inherited
//! permissions, each filtered by tenant visibility.
//!
//! Decisions are memoised in a [`PermissionCache`] owned by the caller for the
//! duration of one request. Resolver methods that change grants or role
//! assignments take the same cache and drop the affected entries.
//!
//! Every denial is written to the audit log as `access_denied`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::audit::{AuditContext, AuditLogger};
use super::store::PermissionStore;
use super::ServiceError;
use crate::models::{
    DirectGrant, EffectivePermissions, Permission, Principal, PrincipalKey, Role,
    RoleAssignment,
};

type CacheKey = (PrincipalKey, String, Option<i64>);

/// Request-scoped memo of authorization decisions.
#[derive(Debug, Default)]
pub struct PermissionCache {
    decisions: HashMap<CacheKey, bool>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, principal: PrincipalKey, slug: &str, tenant_id: Option<i64>) -> Option<bool> {
        self.decisions
            .get(&(principal, slug.to_string(), tenant_id))
            .copied()
    }

    fn insert(&mut self, principal: PrincipalKey, slug: &str, tenant_id: Option<i64>, allowed: bool) {
        self.decisions
            .insert((principal, slug.to_string(), tenant_id), allowed);
    }

    /// Drop every decision for `principal`.
    pub fn invalidate_principal(&mut self, principal: PrincipalKey) {
        self.decisions.retain(|(key, _, _), _| *key != principal);
    }

    pub fn clear(&mut self) {
        self.decisions.clear();
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn PermissionStore>,
    audit: AuditLogger,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn PermissionStore>, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    /// Can `principal` perform `slug` within `tenant_id`? Store failures deny.
    /// A denial is audited against `ctx`.
    #[tracing::instrument(skip(self, cache, ctx, principal), fields(principal = %principal.key()))]
    pub async fn authorize(
        &self,
        cache: &mut PermissionCache,
        ctx: &AuditContext,
        principal: &Principal,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> bool {
        let allowed = self.decide(cache, principal, slug, tenant_id).await;
        if !allowed {
            self.audit.access_denied(ctx, slug, tenant_id).await;
        }
        allowed
    }

    async fn decide(
        &self,
        cache: &mut PermissionCache,
        principal: &Principal,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> bool {
        if principal.is_root {
            return true;
        }

        let key = principal.key();
        if let Some(allowed) = cache.get(key, slug, tenant_id) {
            return allowed;
        }

        let allowed = match self.resolve(key, slug, tenant_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                // Not cached: the next check retries the store.
                tracing::error!(error = %e, "Permission lookup failed, denying");
                return false;
            }
        };

        cache.insert(key, slug, tenant_id, allowed);
        allowed
    }

    async fn resolve(
        &self,
        key: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, ServiceError> {
        if self.store.has_direct_grant(key, slug, tenant_id).await? {
            return Ok(true);
        }
        Ok(self.store.has_role_permission(key, slug, tenant_id).await?)
    }

    /// True when at least one of `slugs` is granted. A denial is audited once
    /// with the slugs joined by `|`.
    pub async fn authorize_any(
        &self,
        cache: &mut PermissionCache,
        ctx: &AuditContext,
        principal: &Principal,
        slugs: &[&str],
        tenant_id: Option<i64>,
    ) -> bool {
        for slug in slugs {
            if self.decide(cache, principal, slug, tenant_id).await {
                return true;
            }
        }
        self.audit
            .access_denied(ctx, &slugs.join("|"), tenant_id)
            .await;
        false
    }

    /// True when every one of `slugs` is granted. An empty list is granted.
    /// The first missing slug is audited.
    pub async fn authorize_all(
        &self,
        cache: &mut PermissionCache,
        ctx: &AuditContext,
        principal: &Principal,
        slugs: &[&str],
        tenant_id: Option<i64>,
    ) -> bool {
        for slug in slugs {
            if !self.authorize(cache, ctx, principal, slug, tenant_id).await {
                return false;
            }
        }
        true
    }

    /// Union of direct and role-inherited slugs visible in `tenant_id`.
    /// Root principals get [`EffectivePermissions::All`]. A store failure
    /// yields the empty set.
    pub async fn get_user_permissions(
        &self,
        principal: &Principal,
        tenant_id: Option<i64>,
    ) -> EffectivePermissions {
        if principal.is_root {
            return EffectivePermissions::All;
        }

        let key = principal.key();
        let collected = async {
            let mut slugs: BTreeSet<String> = self
                .store
                .direct_permission_slugs(key, tenant_id)
                .await?
                .into_iter()
                .collect();
            slugs.extend(self.store.role_permission_slugs(key, tenant_id).await?);
            Ok::<_, ServiceError>(slugs)
        }
        .await;

        match collected {
            Ok(slugs) => EffectivePermissions::Slugs(slugs),
            Err(e) => {
                tracing::error!(error = %e, principal = %key, "Permission enumeration failed");
                EffectivePermissions::Slugs(BTreeSet::new())
            }
        }
    }

    /// Roles assigned to `principal` that are visible in `tenant_id`.
    pub async fn roles_for(&self, principal: &Principal, tenant_id: Option<i64>) -> Vec<Role> {
        match self.store.principal_roles(principal.key(), tenant_id).await {
            Ok(roles) => roles,
            Err(e) => {
                tracing::error!(error = %e, principal = %principal.key(), "Role lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn has_role(
        &self,
        principal: &Principal,
        role_name: &str,
        tenant_id: Option<i64>,
    ) -> bool {
        self.roles_for(principal, tenant_id)
            .await
            .iter()
            .any(|r| r.name == role_name)
    }

    // ==================== Mutations ====================

    pub async fn grant_permission(
        &self,
        cache: &mut PermissionCache,
        grant: &DirectGrant,
    ) -> Result<(), ServiceError> {
        self.store.grant_permission(grant).await?;
        cache.invalidate_principal(grant.principal());
        tracing::info!(
            principal = %grant.principal(),
            slug = %grant.permission_slug,
            tenant_id = grant.tenant_id,
            "Permission granted"
        );
        Ok(())
    }

    pub async fn revoke_permission(
        &self,
        cache: &mut PermissionCache,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, ServiceError> {
        let removed = self.store.revoke_permission(principal, slug, tenant_id).await?;
        cache.invalidate_principal(principal);
        tracing::info!(%principal, slug, tenant_id, removed, "Permission revoked");
        Ok(removed)
    }

    pub async fn assign_role(
        &self,
        cache: &mut PermissionCache,
        assignment: &RoleAssignment,
    ) -> Result<(), ServiceError> {
        self.store.assign_role(assignment).await?;
        cache.invalidate_principal(assignment.principal());
        tracing::info!(
            principal = %assignment.principal(),
            role_id = assignment.role_id,
            "Role assigned"
        );
        Ok(())
    }

    pub async fn unassign_role(
        &self,
        cache: &mut PermissionCache,
        assignment: &RoleAssignment,
    ) -> Result<bool, ServiceError> {
        let removed = self.store.unassign_role(assignment).await?;
        cache.invalidate_principal(assignment.principal());
        tracing::info!(
            principal = %assignment.principal(),
            role_id = assignment.role_id,
            removed,
            "Role unassigned"
        );
        Ok(removed)
    }

    pub async fn register_permission(&self, permission: &Permission) -> Result<(), ServiceError> {
        Ok(self.store.register_permission(permission).await?)
    }

    pub async fn create_role(
        &self,
        name: &str,
        tenant_id: Option<i64>,
    ) -> Result<Role, ServiceError> {
        Ok(self.store.create_role(name, tenant_id).await?)
    }

    /// Attaching affects every holder of the role, so the whole cache goes.
    pub async fn attach_permission(
        &self,
        cache: &mut PermissionCache,
        role_id: i64,
        slug: &str,
    ) -> Result<(), ServiceError> {
        self.store.attach_permission(role_id, slug).await?;
        cache.clear();
        Ok(())
    }

    pub async fn detach_permission(
        &self,
        cache: &mut PermissionCache,
        role_id: i64,
        slug: &str,
    ) -> Result<bool, ServiceError> {
        let removed = self.store.detach_permission(role_id, slug).await?;
        cache.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::{PermissionScope, PrincipalType, Severity};
    use crate::services::store::AuditStore;
    use crate::services::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, PermissionResolver) {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLogger::new(store.clone());
        (store.clone(), PermissionResolver::new(store, audit))
    }

    fn ctx() -> AuditContext {
        AuditContext::new(RequestContext::system("permissions"))
    }

    fn editor() -> Principal {
        Principal::new(11, PrincipalType::Admin, "editor@example.com").with_tenant(5)
    }

    #[tokio::test]
    async fn test_root_bypasses_everything() {
        let (store, resolver) = setup();
        store.set_unavailable(true);
        let root = Principal::new(1, PrincipalType::SuperAdmin, "root@example.com").root();
        let mut cache = PermissionCache::new();

        assert!(resolver.authorize(&mut cache, &ctx(), &root, "anything.at.all", Some(77)).await);
        assert!(resolver.get_user_permissions(&root, None).await.is_all());
    }

    #[tokio::test]
    async fn test_scoped_grant_does_not_leak_across_tenants() {
        let (_, resolver) = setup();
        let principal = editor();
        let mut cache = PermissionCache::new();
        resolver
            .grant_permission(
                &mut cache,
                &DirectGrant::new(principal.key(), "pages.edit", Some(5), None),
            )
            .await
            .unwrap();

        assert!(resolver.authorize(&mut cache, &ctx(), &principal, "pages.edit", Some(5)).await);
        assert!(!resolver.authorize(&mut cache, &ctx(), &principal, "pages.edit", Some(9)).await);
        assert!(!resolver.authorize(&mut cache, &ctx(), &principal, "pages.edit", None).await);
    }

    #[tokio::test]
    async fn test_store_failure_denies_and_is_not_cached() {
        let (store, resolver) = setup();
        let principal = editor();
        let mut cache = PermissionCache::new();
        store
            .grant_permission(&DirectGrant::new(principal.key(), "pages.edit", None, None))
            .await
            .unwrap();

        store.set_unavailable(true);
        assert!(!resolver.authorize(&mut cache, &ctx(), &principal, "pages.edit", Some(5)).await);
        assert!(cache.is_empty());

        store.set_unavailable(false);
        assert!(resolver.authorize(&mut cache, &ctx(), &principal, "pages.edit", Some(5)).await);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_decisions() {
        let (store, resolver) = setup();
        let principal = editor();
        let mut cache = PermissionCache::new();
        store
            .grant_permission(&DirectGrant::new(principal.key(), "blog.view", None, None))
            .await
            .unwrap();

        assert!(resolver.authorize(&mut cache, &ctx(), &principal, "blog.view", Some(5)).await);
        // Revoked behind the resolver's back: the cached decision stands.
        store
            .revoke_permission(principal.key(), "blog.view", None)
            .await
            .unwrap();
        assert!(resolver.authorize(&mut cache, &ctx(), &principal, "blog.view", Some(5)).await);

        // A fresh request sees the change.
        let mut next_request = PermissionCache::new();
        assert!(!resolver.authorize(&mut next_request, &ctx(), &principal, "blog.view", Some(5)).await);
    }

    #[tokio::test]
    async fn test_any_all_and_roles() {
        let (store, resolver) = setup();
        let principal = editor();
        let mut cache = PermissionCache::new();

        store
            .register_permission(&Permission::new("menus.edit", "menus", PermissionScope::Tenant))
            .await
            .unwrap();
        let role = resolver.create_role("menu-manager", Some(5)).await.unwrap();
        resolver
            .attach_permission(&mut cache, role.id, "menus.edit")
            .await
            .unwrap();
        resolver
            .assign_role(&mut cache, &RoleAssignment::new(role.id, principal.key()))
            .await
            .unwrap();

        assert!(resolver.has_role(&principal, "menu-manager", Some(5)).await);
        assert!(!resolver.has_role(&principal, "menu-manager", Some(9)).await);
        assert!(
            resolver
                .authorize_any(&mut cache, &ctx(), &principal, &["pages.edit", "menus.edit"], Some(5))
                .await
        );
        assert!(
            !resolver
                .authorize_all(&mut cache, &ctx(), &principal, &["pages.edit", "menus.edit"], Some(5))
                .await
        );
        assert!(resolver.authorize_all(&mut cache, &ctx(), &principal, &[], Some(5)).await);
    }

    #[tokio::test]
    async fn test_denials_are_audited() {
        let (store, resolver) = setup();
        let principal = Principal::new(2, PrincipalType::Admin, "author@example.com");
        let ctx = ctx().with_principal(&principal);
        let mut cache = PermissionCache::new();

        assert!(!resolver.authorize(&mut cache, &ctx, &principal, "pages.delete", Some(5)).await);
        // Served from the cache, still audited
        assert!(!resolver.authorize(&mut cache, &ctx, &principal, "pages.delete", Some(5)).await);

        let events = AuditStore::recent(store.as_ref(), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == "access_denied"));
        assert!(events.iter().all(|e| e.severity == Severity::Warning));
        assert_eq!(events[0].payload["permission"], "pages.delete");
        assert_eq!(events[0].payload["tenant_id"], 5);
        assert_eq!(events[0].principal.as_ref().unwrap().principal_id, 2);
    }

    #[tokio::test]
    async fn test_only_denials_reach_the_audit_log() {
        let (store, resolver) = setup();
        let principal = editor();
        let mut cache = PermissionCache::new();

        store
            .grant_permission(&DirectGrant::new(principal.key(), "pages.view", None, None))
            .await
            .unwrap();
        assert!(resolver.authorize(&mut cache, &ctx(), &principal, "pages.view", None).await);
        assert!(
            resolver
                .authorize_any(&mut cache, &ctx(), &principal, &["pages.edit", "pages.view"], None)
                .await
        );
        // Grants never produce audit rows
        assert!(AuditStore::recent(store.as_ref(), 10).await.unwrap().is_empty());

        assert!(
            !resolver
                .authorize_any(&mut cache, &ctx(), &principal, &["pages.edit", "pages.delete"], None)
                .await
        );
        let events = AuditStore::recent(store.as_ref(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["permission"], "pages.edit|pages.delete");
    }
}
