//! Permission catalog, roles and direct grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::{PrincipalKey, PrincipalType};

/// Catalog scope. Informational only: authorization matches on slug and
/// tenant, never on scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Superadmin,
    Tenant,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::Superadmin => "superadmin",
            PermissionScope::Tenant => "tenant",
        }
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "superadmin" => Ok(PermissionScope::Superadmin),
            "tenant" => Ok(PermissionScope::Tenant),
            _ => Err(format!("Invalid permission scope: {}", s)),
        }
    }
}

/// Immutable catalog entry, referenced by slug everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Dotted hierarchical name, e.g. `pages.edit`.
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    /// `None` = global.
    pub tenant_id: Option<i64>,
    pub scope: PermissionScope,
}

impl Permission {
    pub fn new(slug: impl Into<String>, category: impl Into<String>, scope: PermissionScope) -> Self {
        let slug = slug.into();
        Self {
            name: slug.clone(),
            slug,
            description: None,
            category: category.into(),
            tenant_id: None,
            scope,
        }
    }

    pub fn for_tenant(mut self, tenant_id: i64) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Global rows are visible from every tenant context.
    pub fn visible_in(&self, tenant_id: Option<i64>) -> bool {
        self.tenant_id.is_none() || self.tenant_id == tenant_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i64,
    pub name: String,
    /// `None` = global role usable from every tenant.
    pub tenant_id: Option<i64>,
}

impl Role {
    pub fn visible_in(&self, tenant_id: Option<i64>) -> bool {
        self.tenant_id.is_none() || self.tenant_id == tenant_id
    }
}

/// Assignment of a role to a principal, tagged with the principal class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role_id: i64,
    pub principal_type: PrincipalType,
    pub principal_id: i64,
}

impl RoleAssignment {
    pub fn new(role_id: i64, principal: PrincipalKey) -> Self {
        Self {
            role_id,
            principal_type: principal.principal_type,
            principal_id: principal.principal_id,
        }
    }

    pub fn principal(&self) -> PrincipalKey {
        PrincipalKey {
            principal_type: self.principal_type,
            principal_id: self.principal_id,
        }
    }
}

/// Permission granted straight to a principal, bypassing roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectGrant {
    pub principal_type: PrincipalType,
    pub principal_id: i64,
    pub permission_slug: String,
    pub tenant_id: Option<i64>,
    pub granted_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl DirectGrant {
    pub fn new(
        principal: PrincipalKey,
        permission_slug: impl Into<String>,
        tenant_id: Option<i64>,
        granted_by: Option<i64>,
    ) -> Self {
        Self {
            principal_type: principal.principal_type,
            principal_id: principal.principal_id,
            permission_slug: permission_slug.into(),
            tenant_id,
            granted_by,
            created_at: Utc::now(),
        }
    }

    pub fn principal(&self) -> PrincipalKey {
        PrincipalKey {
            principal_type: self.principal_type,
            principal_id: self.principal_id,
        }
    }

    /// Global grants apply in every tenant, scoped grants only in their own.
    pub fn applies_to(&self, tenant_id: Option<i64>) -> bool {
        self.tenant_id.is_none() || self.tenant_id == tenant_id
    }
}

/// Result of enumerating a principal's permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EffectivePermissions {
    /// Root bypass; enumerating would be meaningless.
    All,
    Slugs(BTreeSet<String>),
}

impl EffectivePermissions {
    pub fn contains(&self, slug: &str) -> bool {
        match self {
            EffectivePermissions::All => true,
            EffectivePermissions::Slugs(slugs) => slugs.contains(slug),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, EffectivePermissions::All)
    }
}
