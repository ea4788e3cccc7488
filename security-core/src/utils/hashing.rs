use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

/// Memory cost in KiB for one-time code hashes.
const CODE_MEMORY_KIB: u32 = 8 * 1024;
const CODE_ITERATIONS: u32 = 2;

/// Newtype for a user supplied one-time code to prevent accidental logging.
#[derive(Clone)]
pub struct OneTimeCode(String);

impl OneTimeCode {
    /// Strip separators and whitespace, uppercase the rest.
    pub fn normalize(raw: &str) -> Self {
        Self(
            raw.chars()
                .filter(|c| *c != '-' && !c.is_whitespace())
                .flat_map(char::to_uppercase)
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for OneTimeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OneTimeCode(***)")
    }
}

fn hasher() -> Result<Argon2<'static>, anyhow::Error> {
    let params = Params::new(CODE_MEMORY_KIB, CODE_ITERATIONS, 1, None)
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a code with Argon2id. The PHC string carries salt and parameters.
pub fn hash_code(code: &OneTimeCode) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = hasher()?
        .hash_password(code.as_str().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash code: {}", e))?
        .to_string();

    Ok(hash)
}

/// Constant-time verification against a PHC string. Malformed hashes never
/// match.
pub fn verify_code(code: &OneTimeCode, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(code.as_str().as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed code hash");
            false
        }
    }
}
