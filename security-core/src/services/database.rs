//! PostgreSQL implementation of every persistence seam.
//!
//! Enum columns are stored as text and converted at the row boundary, so a
//! value the code no longer knows surfaces as `StoreError::Corrupt` instead
//! of a panic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use super::store::{
    AuditStore, PermissionStore, RateLimitStore, SessionStore, TokenStore, TwoFactorStore,
    WafStore,
};
use super::StoreError;
use crate::models::{
    AuditEvent, DirectGrant, IpBlacklistEntry, Permission, PrincipalKey, PrincipalSnapshot,
    PrincipalType, RateLimitEntry, RememberToken, Role, RoleAssignment, SessionState, Severity,
    TwoFactorSecret, WafLogEntry,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

fn parse_principal_type(raw: &str) -> Result<PrincipalType, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

// ==================== Row Types ====================

#[derive(FromRow)]
struct TokenRow {
    token_hash: String,
    principal_type: String,
    principal_id: i64,
    ip_address: Option<String>,
    user_agent: Option<String>,
    persistent: bool,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<TokenRow> for RememberToken {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            token_hash: row.token_hash,
            principal_type: parse_principal_type(&row.principal_type)?,
            principal_id: row.principal_id,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            persistent: row.persistent,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(FromRow)]
struct RateLimitRow {
    identifier: String,
    attempts: i32,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<RateLimitRow> for RateLimitEntry {
    fn from(row: RateLimitRow) -> Self {
        Self {
            identifier: row.identifier,
            attempts: row.attempts.max(0) as u32,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TwoFactorRow {
    principal_type: String,
    principal_id: i64,
    secret: String,
    recovery_codes: serde_json::Value,
    enabled_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<TwoFactorRow> for TwoFactorSecret {
    type Error = StoreError;

    fn try_from(row: TwoFactorRow) -> Result<Self, Self::Error> {
        Ok(Self {
            principal_type: parse_principal_type(&row.principal_type)?,
            principal_id: row.principal_id,
            secret: row.secret,
            recovery_codes: serde_json::from_value(row.recovery_codes)?,
            enabled_at: row.enabled_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    event_id: Uuid,
    event_type: String,
    severity: String,
    principal_type: Option<String>,
    principal_id: Option<i64>,
    principal_email: Option<String>,
    principal_role: Option<String>,
    tenant_id: Option<i64>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    uri: Option<String>,
    method: Option<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let principal = match (row.principal_type, row.principal_id) {
            (Some(kind), Some(id)) => Some(PrincipalSnapshot {
                principal_id: id,
                principal_type: parse_principal_type(&kind)?,
                email: row.principal_email.unwrap_or_default(),
                role: row.principal_role,
            }),
            _ => None,
        };

        Ok(Self {
            event_id: row.event_id,
            event_type: row.event_type,
            severity: row.severity.parse::<Severity>().map_err(StoreError::Corrupt)?,
            principal,
            tenant_id: row.tenant_id,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            uri: row.uri,
            method: row.method,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

// ==================== Remember Token Operations ====================

#[async_trait]
impl TokenStore for Database {
    async fn rotate(&self, token: &RememberToken) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM session_tokens WHERE principal_type = $1 AND principal_id = $2")
            .bind(token.principal_type.as_str())
            .bind(token.principal_id)
            .execute(&mut *tx)
            .await?;

        // A concurrent rotation may have inserted between our delete and this
        // insert; the unique key adjudicates and the latest token wins.
        sqlx::query(
            r#"
            INSERT INTO session_tokens
                (token_hash, principal_type, principal_id, ip_address, user_agent, persistent, created_at, expires_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (principal_type, principal_id) DO UPDATE SET
                token_hash = EXCLUDED.token_hash,
                ip_address = EXCLUDED.ip_address,
                user_agent = EXCLUDED.user_agent,
                persistent = EXCLUDED.persistent,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                last_used_at = EXCLUDED.last_used_at
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.principal_type.as_str())
        .bind(token.principal_id)
        .bind(&token.ip_address)
        .bind(&token.user_agent)
        .bind(token.persistent)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.last_used_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RememberToken>, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT token_hash, principal_type, principal_id, ip_address, user_agent,
                   persistent, created_at, expires_at, last_used_at
            FROM session_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RememberToken::try_from).transpose()
    }

    async fn extend(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE session_tokens SET expires_at = $2, last_used_at = $3 WHERE token_hash = $1",
        )
        .bind(token_hash)
        .bind(expires_at)
        .bind(used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, token_hash: &str, used_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE session_tokens SET last_used_at = $2 WHERE token_hash = $1")
            .bind(token_hash)
            .bind(used_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_for_principal(
        &self,
        principal: PrincipalKey,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM session_tokens
            WHERE token_hash = $1 AND principal_type = $2 AND principal_id = $3
            "#,
        )
        .bind(token_hash)
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_for_principal(&self, principal: PrincipalKey) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM session_tokens WHERE principal_type = $1 AND principal_id = $2")
                .bind(principal.principal_type.as_str())
                .bind(principal.principal_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Session Operations ====================

const UPSERT_SESSION: &str = r#"
    INSERT INTO sessions
        (session_id, principal_type, principal_id, payload, created_at, last_active_at, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (session_id) DO UPDATE SET
        principal_type = EXCLUDED.principal_type,
        principal_id = EXCLUDED.principal_id,
        payload = EXCLUDED.payload,
        last_active_at = EXCLUDED.last_active_at,
        expires_at = EXCLUDED.expires_at
"#;

#[async_trait]
impl SessionStore for Database {
    async fn load(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionState>, StoreError> {
        let payload = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT payload FROM sessions WHERE session_id = $1 AND expires_at > $2",
        )
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match payload {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        state: &SessionState,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let principal = state.principal.as_ref();
        sqlx::query(UPSERT_SESSION)
            .bind(&state.id)
            .bind(principal.map(|p| p.principal_type.as_str()))
            .bind(principal.map(|p| p.id))
            .bind(serde_json::to_value(state)?)
            .bind(state.created_at)
            .bind(state.last_active_at)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn regenerate(
        &self,
        old_id: &str,
        state: &SessionState,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let principal = state.principal.as_ref();
        let mut tx = self.pool.begin().await?;

        // New row first, then drop the old one, inside one transaction.
        sqlx::query(UPSERT_SESSION)
            .bind(&state.id)
            .bind(principal.map(|p| p.principal_type.as_str()))
            .bind(principal.map(|p| p.id))
            .bind(serde_json::to_value(state)?)
            .bind(state.created_at)
            .bind(state.last_active_at)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

        if old_id != state.id {
            sqlx::query("DELETE FROM sessions WHERE session_id = $1")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Rate Limit Operations ====================

#[async_trait]
impl RateLimitStore for Database {
    async fn find(&self, identifier: &str) -> Result<Option<RateLimitEntry>, StoreError> {
        let row = sqlx::query_as::<_, RateLimitRow>(
            "SELECT identifier, attempts, expires_at, created_at FROM rate_limits WHERE identifier = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RateLimitEntry::from))
    }

    async fn increment(
        &self,
        identifier: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO rate_limits (identifier, attempts, expires_at, created_at)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (identifier) DO UPDATE SET
                attempts = CASE
                    WHEN rate_limits.expires_at <= $3 THEN 1
                    ELSE rate_limits.attempts + 1
                END,
                created_at = CASE
                    WHEN rate_limits.expires_at <= $3 THEN EXCLUDED.created_at
                    ELSE rate_limits.created_at
                END,
                expires_at = EXCLUDED.expires_at
            RETURNING attempts
            "#,
        )
        .bind(identifier)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(attempts.max(0) as u32)
    }

    async fn clear(&self, identifier: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM rate_limits WHERE identifier = $1")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Permission Operations ====================

#[async_trait]
impl PermissionStore for Database {
    async fn has_direct_grant(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_permissions
                WHERE principal_type = $1
                  AND principal_id = $2
                  AND permission_slug = $3
                  AND (tenant_id IS NULL OR tenant_id = $4)
            )
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(slug)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn has_role_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_roles ur
                JOIN roles r ON r.id = ur.role_id
                JOIN role_permissions rp ON rp.role_id = r.id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ur.principal_type = $1
                  AND ur.principal_id = $2
                  AND p.slug = $3
                  AND (r.tenant_id IS NULL OR r.tenant_id = $4)
                  AND (p.tenant_id IS NULL OR p.tenant_id = $4)
            )
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(slug)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn direct_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let slugs = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT permission_slug FROM user_permissions
            WHERE principal_type = $1
              AND principal_id = $2
              AND (tenant_id IS NULL OR tenant_id = $3)
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(slugs)
    }

    async fn role_permission_slugs(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let slugs = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT p.slug
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            JOIN role_permissions rp ON rp.role_id = r.id
            JOIN permissions p ON p.id = rp.permission_id
            WHERE ur.principal_type = $1
              AND ur.principal_id = $2
              AND (r.tenant_id IS NULL OR r.tenant_id = $3)
              AND (p.tenant_id IS NULL OR p.tenant_id = $3)
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(slugs)
    }

    async fn principal_roles(
        &self,
        principal: PrincipalKey,
        tenant_id: Option<i64>,
    ) -> Result<Vec<Role>, StoreError> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.id, r.name, r.tenant_id
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            WHERE ur.principal_type = $1
              AND ur.principal_id = $2
              AND (r.tenant_id IS NULL OR r.tenant_id = $3)
            ORDER BY r.id
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn register_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO permissions (slug, name, description, category, tenant_id, scope)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&permission.slug)
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(&permission.category)
        .bind(permission.tenant_id)
        .bind(permission.scope.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_role(&self, name: &str, tenant_id: Option<i64>) -> Result<Role, StoreError> {
        let role = sqlx::query_as::<_, Role>(
            "INSERT INTO roles (name, tenant_id) VALUES ($1, $2) RETURNING id, name, tenant_id",
        )
        .bind(name)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(role)
    }

    async fn attach_permission(&self, role_id: i64, slug: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, p.id FROM permissions p WHERE p.slug = $2
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(slug)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(role_id, slug, "No new catalog rows attached to role");
        }
        Ok(())
    }

    async fn detach_permission(&self, role_id: i64, slug: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM role_permissions rp
            USING permissions p
            WHERE rp.permission_id = p.id AND rp.role_id = $1 AND p.slug = $2
            "#,
        )
        .bind(role_id)
        .bind(slug)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn grant_permission(&self, grant: &DirectGrant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_permissions
                (principal_type, principal_id, permission_slug, tenant_id, granted_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(grant.principal_type.as_str())
        .bind(grant.principal_id)
        .bind(&grant.permission_slug)
        .bind(grant.tenant_id)
        .bind(grant.granted_by)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_permission(
        &self,
        principal: PrincipalKey,
        slug: &str,
        tenant_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_permissions
            WHERE principal_type = $1
              AND principal_id = $2
              AND permission_slug = $3
              AND tenant_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(slug)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_role(&self, assignment: &RoleAssignment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (role_id, principal_type, principal_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(assignment.role_id)
        .bind(assignment.principal_type.as_str())
        .bind(assignment.principal_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unassign_role(&self, assignment: &RoleAssignment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM user_roles WHERE role_id = $1 AND principal_type = $2 AND principal_id = $3",
        )
        .bind(assignment.role_id)
        .bind(assignment.principal_type.as_str())
        .bind(assignment.principal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ==================== Two-Factor Operations ====================

#[async_trait]
impl TwoFactorStore for Database {
    async fn find(&self, principal: PrincipalKey) -> Result<Option<TwoFactorSecret>, StoreError> {
        let row = sqlx::query_as::<_, TwoFactorRow>(
            r#"
            SELECT principal_type, principal_id, secret, recovery_codes, enabled_at, last_used_at
            FROM principal_two_factor
            WHERE principal_type = $1 AND principal_id = $2
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TwoFactorSecret::try_from).transpose()
    }

    async fn enable(&self, secret: &TwoFactorSecret) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO principal_two_factor
                (principal_type, principal_id, secret, recovery_codes, enabled_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (principal_type, principal_id) DO NOTHING
            "#,
        )
        .bind(secret.principal_type.as_str())
        .bind(secret.principal_id)
        .bind(&secret.secret)
        .bind(serde_json::to_value(&secret.recovery_codes)?)
        .bind(secret.enabled_at)
        .bind(secret.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn disable(&self, principal: PrincipalKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM principal_two_factor WHERE principal_type = $1 AND principal_id = $2",
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_recovery_codes(
        &self,
        principal: PrincipalKey,
        expected: &[String],
        next: &[String],
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE principal_two_factor
            SET recovery_codes = $3
            WHERE principal_type = $1 AND principal_id = $2 AND recovery_codes = $4
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(serde_json::to_value(next)?)
        .bind(serde_json::to_value(expected)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_last_used(
        &self,
        principal: PrincipalKey,
        used_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE principal_two_factor SET last_used_at = $3
            WHERE principal_type = $1 AND principal_id = $2
            "#,
        )
        .bind(principal.principal_type.as_str())
        .bind(principal.principal_id)
        .bind(used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ==================== Audit Log Operations ====================

#[async_trait]
impl AuditStore for Database {
    async fn insert(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let principal = event.principal.as_ref();
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (event_id, event_type, severity, principal_type, principal_id, principal_email,
                 principal_role, tenant_id, ip_address, user_agent, uri, method, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(principal.map(|p| p.principal_type.as_str()))
        .bind(principal.map(|p| p.principal_id))
        .bind(principal.map(|p| p.email.clone()))
        .bind(principal.and_then(|p| p.role.clone()))
        .bind(event.tenant_id)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.uri)
        .bind(&event.method)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT event_id, event_type, severity, principal_type, principal_id, principal_email,
                   principal_role, tenant_id, ip_address, user_agent, uri, method, payload, created_at
            FROM audit_logs
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEvent::try_from).collect()
    }
}

// ==================== WAF Operations ====================

#[async_trait]
impl WafStore for Database {
    async fn record_event(&self, entry: &WafLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO waf_logs (threat_type, source, ip_address, uri, method, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.threat.as_str())
        .bind(&entry.source)
        .bind(&entry.ip_address)
        .bind(&entry.uri)
        .bind(&entry.method)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_blacklisted(&self, ip: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ip_blacklist
                WHERE ip_address = $1 AND (expires_at IS NULL OR expires_at > $2)
            )
            "#,
        )
        .bind(ip)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn blacklist(&self, entry: &IpBlacklistEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ip_blacklist (ip_address, reason, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip_address) DO UPDATE SET
                reason = EXCLUDED.reason,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&entry.ip_address)
        .bind(&entry.reason)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_recent_events(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM waf_logs WHERE ip_address = $1 AND created_at >= $2",
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM ip_blacklist WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
