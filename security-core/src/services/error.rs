use service_core::error::AppError;
use thiserror::Error;

/// Persistence failure. Components convert this into their documented safe
/// default; it only reaches callers through `ServiceError::Store`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid two-factor code")]
    InvalidTwoFactorCode,

    #[error("Two-factor authentication is already enabled")]
    TwoFactorAlreadyEnabled,

    #[error("Two-factor authentication is not enabled")]
    TwoFactorNotEnabled,

    #[error("Invalid two-factor secret")]
    InvalidSecret,

    #[error("CSRF token mismatch")]
    CsrfMismatch,

    #[error("Invalid retention: {0} days")]
    InvalidRetention(i64),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::NotAuthenticated => {
                AppError::Unauthorized(anyhow::anyhow!("Not authenticated"))
            }
            ServiceError::InvalidTwoFactorCode => {
                AppError::AuthError(anyhow::anyhow!("Invalid two-factor code"))
            }
            ServiceError::TwoFactorAlreadyEnabled => {
                AppError::Conflict(anyhow::anyhow!("Two-factor authentication is already enabled"))
            }
            ServiceError::TwoFactorNotEnabled => {
                AppError::BadRequest(anyhow::anyhow!("Two-factor authentication is not enabled"))
            }
            ServiceError::InvalidSecret => {
                AppError::BadRequest(anyhow::anyhow!("Invalid two-factor secret"))
            }
            ServiceError::CsrfMismatch => AppError::Forbidden(anyhow::anyhow!("CSRF token mismatch")),
            ServiceError::InvalidRetention(days) => {
                AppError::ConfigError(anyhow::anyhow!("Invalid retention: {} days", days))
            }
        }
    }
}
