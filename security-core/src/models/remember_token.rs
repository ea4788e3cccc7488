//! Remember-me token model - long-lived bearer credential for session restoration.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use super::{session::random_token, PrincipalKey, PrincipalType};

/// Persisted remember token. Only the SHA-256 of the raw value is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RememberToken {
    pub token_hash: String,
    pub principal_type: PrincipalType,
    pub principal_id: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl RememberToken {
    /// Mint a token for `principal`. Returns the raw value (handed to the
    /// client exactly once) and the row to persist.
    pub fn issue(
        principal: PrincipalKey,
        lifetime: Duration,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> (String, Self) {
        let raw = random_token();
        let token = Self {
            token_hash: hash_token(&raw),
            principal_type: principal.principal_type,
            principal_id: principal.principal_id,
            ip_address,
            user_agent,
            persistent: true,
            created_at: now,
            expires_at: now + lifetime,
            last_used_at: None,
        };
        (raw, token)
    }

    pub fn principal(&self) -> PrincipalKey {
        PrincipalKey {
            principal_type: self.principal_type,
            principal_id: self.principal_id,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when the remaining lifetime is inside the refresh window.
    pub fn needs_refresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= window
    }
}

/// SHA-256 of the raw bearer token, hex encoded.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
