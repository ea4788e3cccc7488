//! Services layer for the security core.
//!
//! Components, their persistence traits and the two store implementations.

pub mod audit;
pub mod csrf;
mod database;
pub mod error;
mod memory;
pub mod permissions;
pub mod rate_limiter;
pub mod session;
pub mod store;
pub mod two_factor;

pub use audit::{AuditContext, AuditLogger, AUDIT_TARGET};
pub use database::Database;
pub use error::{ServiceError, StoreError};
pub use memory::MemoryStore;
pub use permissions::{PermissionCache, PermissionResolver};
pub use rate_limiter::RateLimiter;
pub use session::{ActiveSession, RememberCookie, SessionManager, SessionStatus};
pub use store::{
    AuditStore, PermissionStore, PrincipalDirectory, RateLimitStore, SessionStore, TokenStore,
    TwoFactorStore, WafStore,
};
pub use two_factor::{TwoFactorAuth, TwoFactorSetup};
