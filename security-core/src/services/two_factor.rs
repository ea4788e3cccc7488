//! TOTP (RFC 6238) second factor with one-time recovery codes.

use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};

use super::store::TwoFactorStore;
use super::ServiceError;
use crate::config::TwoFactorConfig;
use crate::models::{PrincipalKey, TwoFactorSecret};
use crate::utils::hashing::{hash_code, verify_code, OneTimeCode};

pub const SECRET_BYTES: usize = 20;
pub const RECOVERY_CODE_COUNT: usize = 10;
const DIGITS: usize = 6;
const STEP_SECONDS: u64 = 30;
/// Accepted clock drift in steps on either side.
const SKEW_STEPS: u8 = 1;
/// Attempts at the compare-and-swap before giving up on a recovery code.
const RECOVERY_CAS_ATTEMPTS: usize = 3;

/// Material shown to the principal while setting up an authenticator app.
#[derive(Debug, Clone)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Clone)]
pub struct TwoFactorAuth {
    store: Arc<dyn TwoFactorStore>,
    issuer: String,
}

impl TwoFactorAuth {
    pub fn new(store: Arc<dyn TwoFactorStore>, config: &TwoFactorConfig) -> Self {
        Self {
            store,
            issuer: config.issuer.clone(),
        }
    }

    /// 20 random bytes, base32 encoded without padding.
    pub fn generate_secret() -> String {
        let mut bytes = vec![0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Display of an encoded secret is its base32 form
        Secret::Raw(bytes).to_encoded().to_string()
    }

    /// `otpauth://` URI for QR provisioning.
    pub fn provisioning_uri(&self, secret: &str, email: &str) -> String {
        let issuer = urlencoding::encode(&self.issuer);
        format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={DIGITS}&period={STEP_SECONDS}",
            issuer = issuer,
            account = urlencoding::encode(email),
            secret = secret,
        )
    }

    /// Secret and URI for a new enrolment. Nothing is persisted until
    /// [`enable`](Self::enable) confirms a code.
    pub fn begin_setup(&self, email: &str) -> TwoFactorSetup {
        let secret = Self::generate_secret();
        let provisioning_uri = self.provisioning_uri(&secret, email);
        TwoFactorSetup {
            secret,
            provisioning_uri,
        }
    }

    fn totp(secret: &str) -> Result<TOTP, ServiceError> {
        let bytes = Secret::Encoded(secret.trim().to_uppercase())
            .to_bytes()
            .map_err(|_| ServiceError::InvalidSecret)?;
        TOTP::new(Algorithm::SHA1, DIGITS, SKEW_STEPS, STEP_SECONDS, bytes)
            .map_err(|_| ServiceError::InvalidSecret)
    }

    /// Code for the 30-second step containing `time` (unix seconds).
    pub fn generate_code_at(secret: &str, time: u64) -> Result<String, ServiceError> {
        Ok(Self::totp(secret)?.generate(time))
    }

    /// Accept the code for the step containing `time` or either neighbour.
    /// Comparison is constant time. Malformed secrets never verify, nor does
    /// a `time` inside the first skew window, which has no earlier step.
    pub fn verify_code_at(secret: &str, code: &str, time: u64) -> bool {
        let code = code.trim();
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if time < STEP_SECONDS * u64::from(SKEW_STEPS) {
            return false;
        }
        match Self::totp(secret) {
            Ok(totp) => totp.check(code, time),
            Err(_) => false,
        }
    }

    pub fn verify_code(secret: &str, code: &str) -> bool {
        Self::verify_code_at(secret, code, unix_now())
    }

    pub async fn is_enabled(&self, principal: PrincipalKey) -> Result<bool, ServiceError> {
        Ok(self.store.find(principal).await?.is_some())
    }

    /// Persist the full configuration once `confirmation_code` proves the
    /// authenticator holds `secret`. Returns the plaintext recovery codes,
    /// which are never retrievable again.
    #[tracing::instrument(skip(self, secret, confirmation_code), fields(principal = %principal))]
    pub async fn enable(
        &self,
        principal: PrincipalKey,
        secret: &str,
        confirmation_code: &str,
    ) -> Result<Vec<String>, ServiceError> {
        Self::totp(secret)?;
        if self.store.find(principal).await?.is_some() {
            return Err(ServiceError::TwoFactorAlreadyEnabled);
        }
        if !Self::verify_code(secret, confirmation_code) {
            return Err(ServiceError::InvalidTwoFactorCode);
        }

        let (plain, hashed) = generate_recovery_codes().await?;
        let row = TwoFactorSecret {
            principal_type: principal.principal_type,
            principal_id: principal.principal_id,
            secret: secret.trim().to_uppercase(),
            recovery_codes: hashed,
            enabled_at: Utc::now(),
            last_used_at: None,
        };

        if !self.store.enable(&row).await? {
            return Err(ServiceError::TwoFactorAlreadyEnabled);
        }

        tracing::info!("Two-factor authentication enabled");
        Ok(plain)
    }

    /// Remove secret, recovery codes and timestamps together.
    pub async fn disable(&self, principal: PrincipalKey) -> Result<(), ServiceError> {
        if !self.store.disable(principal).await? {
            return Err(ServiceError::TwoFactorNotEnabled);
        }
        tracing::info!(%principal, "Two-factor authentication disabled");
        Ok(())
    }

    /// Check a TOTP code against the stored secret. Fails closed.
    pub async fn verify(&self, principal: PrincipalKey, code: &str) -> bool {
        self.verify_at(principal, code, Utc::now()).await
    }

    pub async fn verify_at(&self, principal: PrincipalKey, code: &str, now: DateTime<Utc>) -> bool {
        let row = match self.store.find(principal).await {
            Ok(Some(row)) => row,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, %principal, "Two-factor lookup failed");
                return false;
            }
        };

        let valid = Self::verify_code_at(&row.secret, code, now.timestamp().max(0) as u64);
        if valid {
            if let Err(e) = self.store.touch_last_used(principal, now).await {
                tracing::warn!(error = %e, %principal, "Failed to record two-factor use");
            }
        } else {
            tracing::warn!(%principal, "Invalid two-factor code");
        }
        valid
    }

    /// Consume a recovery code. Each code verifies at most once, even under
    /// concurrent submissions. Fails closed.
    pub async fn verify_recovery_code(&self, principal: PrincipalKey, code: &str) -> bool {
        match self.consume_recovery_code(principal, code).await {
            Ok(consumed) => consumed,
            Err(e) => {
                tracing::error!(error = %e, %principal, "Recovery code verification failed");
                false
            }
        }
    }

    async fn consume_recovery_code(
        &self,
        principal: PrincipalKey,
        code: &str,
    ) -> Result<bool, ServiceError> {
        let code = OneTimeCode::normalize(code);
        if code.is_empty() {
            return Ok(false);
        }

        for _ in 0..RECOVERY_CAS_ATTEMPTS {
            let Some(row) = self.store.find(principal).await? else {
                return Ok(false);
            };

            let Some(index) = find_matching_code(&code, &row.recovery_codes).await? else {
                tracing::warn!(%principal, "Recovery code rejected");
                return Ok(false);
            };

            let mut remaining = row.recovery_codes.clone();
            remaining.remove(index);

            if self
                .store
                .replace_recovery_codes(principal, &row.recovery_codes, &remaining)
                .await?
            {
                tracing::warn!(%principal, remaining = remaining.len(), "Recovery code consumed");
                return Ok(true);
            }
            // List changed underneath us; reload and look again.
        }

        tracing::warn!(%principal, "Recovery code consumption lost every race");
        Ok(false)
    }

    /// Replace all recovery codes with a fresh set.
    pub async fn regenerate_recovery_codes(
        &self,
        principal: PrincipalKey,
    ) -> Result<Vec<String>, ServiceError> {
        let row = self
            .store
            .find(principal)
            .await?
            .ok_or(ServiceError::TwoFactorNotEnabled)?;

        let (plain, hashed) = generate_recovery_codes().await?;
        if !self
            .store
            .replace_recovery_codes(principal, &row.recovery_codes, &hashed)
            .await?
        {
            return Err(ServiceError::Store(super::StoreError::Conflict(
                "recovery codes changed concurrently".to_string(),
            )));
        }

        tracing::info!(%principal, "Recovery codes regenerated");
        Ok(plain)
    }

    pub async fn remaining_recovery_codes(
        &self,
        principal: PrincipalKey,
    ) -> Result<usize, ServiceError> {
        Ok(self
            .store
            .find(principal)
            .await?
            .map(|row| row.recovery_codes.len())
            .unwrap_or(0))
    }
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// `XXXX-XXXX`, eight random digits.
fn random_recovery_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..100_000_000);
    let digits = format!("{:08}", n);
    format!("{}-{}", &digits[..4], &digits[4..])
}

/// Plaintext codes for display and their Argon2 hashes for storage.
async fn generate_recovery_codes() -> Result<(Vec<String>, Vec<String>), ServiceError> {
    tokio::task::spawn_blocking(|| {
        let plain: Vec<String> = (0..RECOVERY_CODE_COUNT)
            .map(|_| random_recovery_code())
            .collect();
        let hashed = plain
            .iter()
            .map(|code| hash_code(&OneTimeCode::normalize(code)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, anyhow::Error>((plain, hashed))
    })
    .await
    .map_err(|e| anyhow::anyhow!("Recovery code generation task failed: {}", e))?
    .map_err(ServiceError::from)
}

async fn find_matching_code(
    code: &OneTimeCode,
    hashes: &[String],
) -> Result<Option<usize>, ServiceError> {
    let code = code.clone();
    let hashes = hashes.to_vec();
    let index = tokio::task::spawn_blocking(move || {
        hashes.iter().position(|hash| verify_code(&code, hash))
    })
    .await
    .map_err(|e| anyhow::anyhow!("Recovery code verification task failed: {}", e))?;
    Ok(index)
}
