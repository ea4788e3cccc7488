//! Principal model - the authenticated actor behind a session.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three identity classes of the CMS. Every persisted row that belongs to
/// a principal is keyed by `(principal_type, principal_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    SuperAdmin,
    Admin,
    User,
}

impl PrincipalType {
    pub const ALL: [PrincipalType; 3] = [
        PrincipalType::SuperAdmin,
        PrincipalType::Admin,
        PrincipalType::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::SuperAdmin => "super_admin",
            PrincipalType::Admin => "admin",
            PrincipalType::User => "user",
        }
    }
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(PrincipalType::SuperAdmin),
            "admin" => Ok(PrincipalType::Admin),
            "user" => Ok(PrincipalType::User),
            _ => Err(format!("Invalid principal type: {}", s)),
        }
    }
}

/// Identity of the currently authenticated actor, held in session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub principal_type: PrincipalType,
    /// `None` for global principals (super admins, cross-tenant staff).
    pub tenant_id: Option<i64>,
    pub role: Option<String>,
    /// Root super admins bypass every permission check.
    #[serde(default)]
    pub is_root: bool,
    pub email: String,
    pub display_name: Option<String>,
}

impl Principal {
    pub fn new(id: i64, principal_type: PrincipalType, email: impl Into<String>) -> Self {
        Self {
            id,
            principal_type,
            tenant_id: None,
            role: None,
            is_root: false,
            email: email.into(),
            display_name: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: i64) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn root(mut self) -> Self {
        self.is_root = true;
        self
    }

    /// Stable key used for logging and cache partitioning.
    pub fn key(&self) -> PrincipalKey {
        PrincipalKey {
            principal_type: self.principal_type,
            principal_id: self.id,
        }
    }
}

/// `(principal_type, principal_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalKey {
    pub principal_type: PrincipalType,
    pub principal_id: i64,
}

impl fmt::Display for PrincipalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.principal_type, self.principal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_type_round_trips_through_str() {
        for kind in PrincipalType::ALL {
            assert_eq!(kind.as_str().parse::<PrincipalType>().unwrap(), kind);
        }
        assert!("root".parse::<PrincipalType>().is_err());
    }

    #[test]
    fn test_principal_key_display() {
        let principal = Principal::new(42, PrincipalType::Admin, "a@example.com").with_tenant(5);
        assert_eq!(principal.key().to_string(), "admin:42");
        assert_eq!(principal.tenant_id, Some(5));
    }
}
