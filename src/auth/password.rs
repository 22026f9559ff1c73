/// Password Hashing and Verification
///
/// Argon2id with a random per-call salt. The salt and cost parameters are
/// embedded in the PHC digest, so only the digest string is stored.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::configuration::PasswordSettings;
use crate::error::AppError;

#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    // Verified against when a login names an unknown account, so the
    // response time does not reveal whether the email exists
    dummy_digest: String,
}

impl PasswordHasher {
    /// # Errors
    /// `Config` if the cost parameters are out of Argon2's accepted range
    pub fn new(settings: &PasswordSettings) -> Result<Self, AppError> {
        let params = Params::new(settings.memory_kib, settings.iterations, settings.parallelism, None)
            .map_err(|e| AppError::Config(format!("invalid argon2 parameters: {}", e)))?;

        let mut hasher = Self {
            params,
            dummy_digest: String::new(),
        };
        hasher.dummy_digest = hasher.hash(&SaltString::generate(&mut OsRng).to_string())?;
        Ok(hasher)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password into a PHC string
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
    }

    /// Verify a password against a stored digest.
    ///
    /// A malformed digest counts as a mismatch.
    pub fn verify(&self, password: &str, digest: &str) -> bool {
        let parsed = match PasswordHash::new(digest) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Stored password digest is malformed: {}", e);
                return false;
            }
        };

        self.argon2().verify_password(password.as_bytes(), &parsed).is_ok()
    }

    /// `hash` on the blocking thread pool
    pub async fn hash_blocking(&self, password: &str) -> Result<String, AppError> {
        let hasher = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("Password hashing task failed: {}", e)))?
    }

    /// `verify` on the blocking thread pool
    pub async fn verify_blocking(&self, password: &str, digest: &str) -> Result<bool, AppError> {
        let hasher = self.clone();
        let password = password.to_string();
        let digest = digest.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &digest))
            .await
            .map_err(|e| AppError::Internal(format!("Password verification task failed: {}", e)))
    }

    /// Burn the same CPU time as a real verification
    pub async fn verify_dummy(&self, password: &str) -> Result<(), AppError> {
        self.verify_blocking(password, &self.dummy_digest).await.map(|_| ())
    }
}
