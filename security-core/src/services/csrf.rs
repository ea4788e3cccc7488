//! Per-session CSRF tokens.

use subtle::ConstantTimeEq;

use super::ServiceError;
use crate::models::{random_token, SessionState};

/// Header carrying the token on state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Constant-time comparison of the session token and the submitted one.
pub fn tokens_match(expected: &str, submitted: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}

pub fn verify(session: &SessionState, submitted: Option<&str>) -> Result<(), ServiceError> {
    match submitted {
        Some(token) if tokens_match(&session.csrf_token, token) => Ok(()),
        _ => Err(ServiceError::CsrfMismatch),
    }
}

/// Replace the session token, e.g. after a privilege change.
pub fn rotate(session: &mut SessionState) -> String {
    session.csrf_token = random_token();
    session.csrf_token.clone()
}

/// Safe methods never carry state changes and skip verification.
pub fn requires_verification(method: &axum::http::Method) -> bool {
    !matches!(
        *method,
        axum::http::Method::GET
            | axum::http::Method::HEAD
            | axum::http::Method::OPTIONS
            | axum::http::Method::TRACE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use chrono::Utc;

    #[test]
    fn test_verify() {
        let session = SessionState::new(Utc::now());
        let token = session.csrf_token.clone();
        assert!(verify(&session, Some(&token)).is_ok());
        assert!(matches!(
            verify(&session, Some("forged")),
            Err(ServiceError::CsrfMismatch)
        ));
        assert!(verify(&session, None).is_err());
    }

    #[test]
    fn test_empty_expected_never_matches() {
        assert!(!tokens_match("", ""));
    }

    #[test]
    fn test_rotate_invalidates_old_token() {
        let mut session = SessionState::new(Utc::now());
        let old = session.csrf_token.clone();
        let new = rotate(&mut session);
        assert_ne!(old, new);
        assert!(verify(&session, Some(&old)).is_err());
        assert!(verify(&session, Some(&new)).is_ok());
    }

    #[test]
    fn test_safe_methods_skip_verification() {
        assert!(!requires_verification(&Method::GET));
        assert!(!requires_verification(&Method::HEAD));
        assert!(requires_verification(&Method::POST));
        assert!(requires_verification(&Method::DELETE));
    }
}
