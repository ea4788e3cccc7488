//! Session state - the explicit replacement for an implicit session global.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::Principal;

/// Length in bytes of generated session identifiers and CSRF tokens.
const RANDOM_TOKEN_BYTES: usize = 32;

/// Server-side session state owned by the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Last time the identifier was regenerated (fixation mitigation clock).
    pub regenerated_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub persistent: bool,
    pub principal: Option<Principal>,
    pub csrf_token: String,
    /// Set after password verification while a second factor is pending.
    #[serde(default)]
    pub pending_two_factor: Option<Principal>,
}

impl SessionState {
    /// Fresh anonymous session.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: random_token(),
            created_at: now,
            regenerated_at: now,
            last_active_at: None,
            persistent: false,
            principal: None,
            csrf_token: random_token(),
            pending_two_factor: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// Seconds since the last recorded activity, `None` when never active.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_active_at
            .map(|last| (now - last).num_seconds())
    }

    /// Seconds since the identifier was last regenerated.
    pub fn seconds_since_regeneration(&self, now: DateTime<Utc>) -> i64 {
        (now - self.regenerated_at).num_seconds()
    }

    /// Drop identity and flags, keeping nothing but a new anonymous shell.
    pub fn clear(&mut self, now: DateTime<Utc>) {
        *self = SessionState::new(now);
    }
}

/// 32 random bytes, hex encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; RANDOM_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_session_is_anonymous() {
        let now = Utc::now();
        let state = SessionState::new(now);
        assert!(!state.is_authenticated());
        assert_eq!(state.id.len(), 64);
        assert_eq!(state.csrf_token.len(), 64);
        assert_ne!(state.id, state.csrf_token);
        assert!(state.idle_seconds(now).is_none());
    }

    #[test]
    fn test_idle_seconds() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        state.last_active_at = Some(now - Duration::seconds(1801));
        assert_eq!(state.idle_seconds(now), Some(1801));
    }

    #[test]
    fn test_clear_rotates_everything() {
        let now = Utc::now();
        let mut state = SessionState::new(now);
        let old_id = state.id.clone();
        let old_csrf = state.csrf_token.clone();
        state.persistent = true;
        state.clear(now);
        assert!(!state.persistent);
        assert_ne!(state.id, old_id);
        assert_ne!(state.csrf_token, old_csrf);
    }
}
