//! Two-factor configuration persisted per principal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PrincipalKey, PrincipalType};

/// Fully configured TOTP state. Absence of a row means 2FA is disabled; there
/// is no partially configured state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorSecret {
    pub principal_type: PrincipalType,
    pub principal_id: i64,
    /// Base32 encoded 20-byte secret.
    pub secret: String,
    /// Argon2 PHC strings, one per unused recovery code.
    pub recovery_codes: Vec<String>,
    pub enabled_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl TwoFactorSecret {
    pub fn principal(&self) -> PrincipalKey {
        PrincipalKey {
            principal_type: self.principal_type,
            principal_id: self.principal_id,
        }
    }
}
