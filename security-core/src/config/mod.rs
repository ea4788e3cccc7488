use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub log_dir: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub waf: WafConfig,
    pub two_factor: TwoFactorConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_seconds: i64,
    pub persistent_idle_timeout_seconds: i64,
    pub regenerate_interval_seconds: i64,
    pub remember_lifetime_days: i64,
    pub remember_refresh_days: i64,
    pub cookie_name: String,
    pub remember_cookie_name: String,
    pub cookie_secure: bool,
    pub cookie_domain: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 1800,
            persistent_idle_timeout_seconds: 86400,
            regenerate_interval_seconds: 1800,
            remember_lifetime_days: 30,
            remember_refresh_days: 7,
            cookie_name: "cms_session".to_string(),
            remember_cookie_name: "remember_token".to_string(),
            cookie_secure: true,
            cookie_domain: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_decay_minutes: i64,
    pub password_reset_attempts: u32,
    pub password_reset_decay_minutes: i64,
    pub purge_interval_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_attempts: 5,
            login_decay_minutes: 15,
            password_reset_attempts: 3,
            password_reset_decay_minutes: 60,
            purge_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WafConfig {
    pub enabled: bool,
    pub max_body_bytes: usize,
    /// Blocks per IP within an hour before the IP is blacklisted; 0 disables.
    pub auto_blacklist_threshold: u64,
    pub blacklist_minutes: i64,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_bytes: 1024 * 1024,
            auto_blacklist_threshold: 0,
            blacklist_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoFactorConfig {
    pub issuer: String,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            issuer: "CMS".to_string(),
        }
    }
}

/// Upper bound on audit retention, one century.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "security-core".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "postgres://localhost/cms".to_string(),
                max_connections: 10,
            },
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            waf: WafConfig::default(),
            two_factor: TwoFactorConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl SecurityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = SecurityConfig {
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("security-core"), false)?,
            log_level: get_env("LOG_LEVEL", Some(common_config.log_level.as_str()), false)?,
            log_dir: env::var("LOG_DIR").ok().or_else(|| common_config.log_dir.clone()),
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .or_else(|| common_config.otlp_endpoint.clone()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", Some("postgres://localhost/cms"), is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
            },
            session: SessionConfig {
                idle_timeout_seconds: parse_env("SESSION_IDLE_TIMEOUT_SECONDS", "1800")?,
                persistent_idle_timeout_seconds: parse_env(
                    "SESSION_PERSISTENT_IDLE_TIMEOUT_SECONDS",
                    "86400",
                )?,
                regenerate_interval_seconds: parse_env(
                    "SESSION_REGENERATE_INTERVAL_SECONDS",
                    "1800",
                )?,
                remember_lifetime_days: parse_env("REMEMBER_TOKEN_LIFETIME_DAYS", "30")?,
                remember_refresh_days: parse_env("REMEMBER_TOKEN_REFRESH_DAYS", "7")?,
                cookie_name: get_env("SESSION_COOKIE_NAME", Some("cms_session"), false)?,
                remember_cookie_name: get_env(
                    "REMEMBER_COOKIE_NAME",
                    Some("remember_token"),
                    false,
                )?,
                cookie_secure: parse_env("COOKIE_SECURE", "true")?,
                cookie_domain: env::var("COOKIE_DOMAIN").ok().filter(|d| !d.is_empty()),
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", "5")?,
                login_decay_minutes: parse_env("RATE_LIMIT_LOGIN_DECAY_MINUTES", "15")?,
                password_reset_attempts: parse_env("RATE_LIMIT_PASSWORD_RESET_ATTEMPTS", "3")?,
                password_reset_decay_minutes: parse_env(
                    "RATE_LIMIT_PASSWORD_RESET_DECAY_MINUTES",
                    "60",
                )?,
                purge_interval_seconds: parse_env("RATE_LIMIT_PURGE_INTERVAL_SECONDS", "60")?,
            },
            waf: WafConfig {
                enabled: parse_env("WAF_ENABLED", "true")?,
                max_body_bytes: parse_env("WAF_MAX_BODY_BYTES", "1048576")?,
                auto_blacklist_threshold: parse_env("WAF_AUTO_BLACKLIST_THRESHOLD", "0")?,
                blacklist_minutes: parse_env("WAF_BLACKLIST_MINUTES", "60")?,
            },
            two_factor: TwoFactorConfig {
                issuer: get_env("TWO_FACTOR_ISSUER", Some("CMS"), false)?,
            },
            audit: AuditConfig {
                retention_days: parse_env("AUDIT_RETENTION_DAYS", "90")?,
            },
            common: common_config,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let session = &self.session;

        if session.idle_timeout_seconds <= 0 || session.persistent_idle_timeout_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Session idle timeouts must be positive"
            )));
        }

        if session.persistent_idle_timeout_seconds < session.idle_timeout_seconds {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_PERSISTENT_IDLE_TIMEOUT_SECONDS must not be shorter than SESSION_IDLE_TIMEOUT_SECONDS"
            )));
        }

        if session.regenerate_interval_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_REGENERATE_INTERVAL_SECONDS must be positive"
            )));
        }

        if session.remember_lifetime_days <= 0
            || session.remember_refresh_days < 0
            || session.remember_refresh_days >= session.remember_lifetime_days
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REMEMBER_TOKEN_REFRESH_DAYS must be shorter than REMEMBER_TOKEN_LIFETIME_DAYS"
            )));
        }

        if self.rate_limit.login_attempts == 0 || self.rate_limit.login_decay_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Login rate limit must allow at least one attempt over a positive window"
            )));
        }

        if !(1..=MAX_RETENTION_DAYS).contains(&self.audit.retention_days) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUDIT_RETENTION_DAYS must be between 1 and {}",
                MAX_RETENTION_DAYS
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod {
            if !session.cookie_secure {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "COOKIE_SECURE must be true in production"
                )));
            }

            if !self.waf.enabled {
                tracing::warn!("WAF is disabled in production");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    get_env(key, Some(default), false)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
