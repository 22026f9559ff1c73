/// Session Issuer
///
/// Mints access/refresh token pairs and drives the refresh-token state machine:
///
/// ```text
/// Active --rotate--> Rotated      (successor created in the same family)
/// Active --revoke--> Revoked      (logout, expiry, reuse detection)
/// ```
///
/// Both end states are absorbing. Presenting a token that is no longer active
/// is treated as theft and revokes its whole family.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::jwt::generate_access_token;
use crate::auth::lockout::{LockoutPolicy, LockoutState, LoginAttempt};
use crate::auth::password::PasswordHasher;
use crate::auth::refresh_token::{generate_refresh_token, hash_token};
use crate::configuration::{JwtSettings, SessionSettings, Settings};
use crate::error::AppError;
use crate::store::{
    CredentialStore, NewRefreshToken, NewUser, RefreshTokenLedger, RefreshTokenRecord, Role, User,
    UserProfile,
};
use crate::validators::{is_valid_email, is_valid_username, validate_password};

/// Token pair handed to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

/// Result of registration or login
#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub user: UserProfile,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

pub struct SessionIssuer {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn RefreshTokenLedger>,
    hasher: PasswordHasher,
    lockout: LockoutPolicy,
    jwt: JwtSettings,
    session: SessionSettings,
}

impl SessionIssuer {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn RefreshTokenLedger>,
        hasher: PasswordHasher,
        lockout: LockoutPolicy,
        jwt: JwtSettings,
        session: SessionSettings,
    ) -> Self {
        Self {
            credentials,
            ledger,
            hasher,
            lockout,
            jwt,
            session,
        }
    }

    pub fn from_settings(
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn RefreshTokenLedger>,
        settings: &Settings,
    ) -> Result<Self, AppError> {
        Ok(Self::new(
            credentials,
            ledger,
            PasswordHasher::new(&settings.password)?,
            LockoutPolicy::from_settings(&settings.lockout),
            settings.jwt.clone(),
            settings.session.clone(),
        ))
    }

    pub fn jwt_settings(&self) -> &JwtSettings {
        &self.jwt
    }

    /// Create an account and open its first session under a new family.
    ///
    /// # Errors
    /// - `Validation` for malformed input
    /// - `Conflict` if email or username is taken, ignoring case
    pub async fn register(&self, email: &str, username: &str, password: &str) -> Result<AuthSession, AppError> {
        let email = is_valid_email(email)?;
        let username = is_valid_username(username)?;
        validate_password(password)?;

        if self.credentials.find_user_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict("email".to_string()));
        }
        if self.credentials.find_user_by_username(&username).await?.is_some() {
            return Err(AppError::Conflict("username".to_string()));
        }

        let password_hash = self.hasher.hash_blocking(password).await?;

        // A concurrent registration can still win; the unique index reports it as Conflict
        let user = self
            .credentials
            .create_user(NewUser {
                email,
                username,
                password_hash,
                role: Role::User,
            })
            .await?;

        let tokens = self.open_session(&user).await?;
        tracing::info!(user_id = %user.id, "User registered");

        Ok(AuthSession {
            user: user.profile(),
            tokens,
        })
    }

    /// Authenticate with email and password.
    ///
    /// The attempt is counted before the password is checked and cleared
    /// again on success.
    ///
    /// # Errors
    /// - `AccountLocked` while a lockout window is running (password not checked)
    /// - `AuthRequired` for an unknown email or a wrong password
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AppError> {
        let now = Utc::now();

        let Some(user) = self.credentials.find_user_by_email(email.trim()).await? else {
            self.hasher.verify_dummy(password).await?;
            return Err(AppError::AuthRequired);
        };

        let reserved = match self
            .credentials
            .reserve_login_attempt(user.id, self.lockout.reserve(now), now)
            .await?
        {
            Some(LoginAttempt::Reserved(state)) => state,
            Some(LoginAttempt::Locked) => {
                tracing::warn!(user_id = %user.id, "Login rejected: account locked");
                return Err(AppError::AccountLocked);
            }
            None => return Err(AppError::AuthRequired),
        };

        if !self.hasher.verify_blocking(password, &user.password_hash).await? {
            log_failed_login(&user, reserved, now);
            return Err(AppError::AuthRequired);
        }

        if !self.credentials.clear_login_attempts(user.id, reserved, Utc::now()).await? {
            tracing::debug!(user_id = %user.id, "Concurrent attempts changed the lockout state; left as is");
        }

        let tokens = self.open_session(&user).await?;
        tracing::info!(user_id = %user.id, "User logged in");

        Ok(AuthSession {
            user: user.profile(),
            tokens,
        })
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// Every failure is `AuthRequired`; reuse detection revokes the family as
    /// a side effect without telling the caller.
    pub async fn refresh(&self, raw_refresh_token: &str) -> Result<TokenPair, AppError> {
        let now = Utc::now();
        let token_hash = hash_token(raw_refresh_token);

        let Some(record) = self.ledger.find_refresh_token_by_hash(&token_hash).await? else {
            tracing::debug!("Refresh token not found");
            return Err(AppError::AuthRequired);
        };

        if record.is_revoked {
            self.revoke_on_reuse(&record).await?;
            return Err(AppError::AuthRequired);
        }

        if record.is_expired(now) {
            self.ledger.revoke_token(record.id).await?;
            tracing::info!(user_id = %record.user_id, "Refresh token expired");
            return Err(AppError::AuthRequired);
        }

        let Some(user) = self.credentials.find_user_by_id(record.user_id).await? else {
            self.ledger.revoke_family(record.family_id).await?;
            return Err(AppError::AuthRequired);
        };

        let refresh_token = generate_refresh_token();
        let successor = self.new_refresh_token(&user, record.family_id, &refresh_token, now);

        if self.ledger.rotate_refresh_token(record.id, successor).await?.is_none() {
            // A concurrent request consumed this token first
            self.revoke_on_reuse(&record).await?;
            return Err(AppError::AuthRequired);
        }

        tracing::info!(user_id = %user.id, family_id = %record.family_id, "Refresh token rotated");
        self.token_pair(&user, refresh_token)
    }

    /// Revoke the whole family of the presented token.
    ///
    /// Unknown tokens and tokens owned by someone else are ignored.
    pub async fn logout(&self, user_id: Uuid, raw_refresh_token: &str) -> Result<(), AppError> {
        let token_hash = hash_token(raw_refresh_token);

        match self.ledger.find_refresh_token_by_hash(&token_hash).await? {
            Some(record) if record.user_id == user_id => {
                let revoked = self.ledger.revoke_family(record.family_id).await?;
                tracing::info!(
                    user_id = %user_id,
                    family_id = %record.family_id,
                    revoked,
                    "Session family revoked on logout"
                );
            }
            Some(_) => {
                tracing::warn!(user_id = %user_id, "Logout with a refresh token owned by another user");
            }
            None => {
                tracing::debug!(user_id = %user_id, "Logout with unknown refresh token");
            }
        }

        Ok(())
    }

    /// Replace the password after re-verifying the current one.
    ///
    /// Lockout counters are neither consulted nor updated.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let user = self
            .credentials
            .find_user_by_id(user_id)
            .await?
            .ok_or(AppError::AuthRequired)?;

        if !self.hasher.verify_blocking(current_password, &user.password_hash).await? {
            tracing::warn!(user_id = %user_id, "Password change rejected: wrong current password");
            return Err(AppError::AuthRequired);
        }

        validate_password(new_password)?;
        let password_hash = self.hasher.hash_blocking(new_password).await?;

        if !self.credentials.update_password_hash(user_id, &password_hash).await? {
            return Err(AppError::AuthRequired);
        }

        if self.session.revoke_on_password_change {
            let revoked = self.ledger.revoke_user_tokens(user_id).await?;
            tracing::info!(user_id = %user_id, revoked, "Password changed, sessions revoked");
        } else {
            tracing::info!(user_id = %user_id, "Password changed");
        }

        Ok(())
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<UserProfile, AppError> {
        self.credentials
            .find_user_by_id(user_id)
            .await?
            .map(|user| user.profile())
            .ok_or(AppError::AuthRequired)
    }

    async fn revoke_on_reuse(&self, record: &RefreshTokenRecord) -> Result<(), AppError> {
        let revoked = self.ledger.revoke_family(record.family_id).await?;
        tracing::warn!(
            user_id = %record.user_id,
            family_id = %record.family_id,
            revoked,
            "Refresh token reuse detected, family revoked"
        );
        Ok(())
    }

    /// Start a new token family for `user`
    async fn open_session(&self, user: &User) -> Result<TokenPair, AppError> {
        let refresh_token = generate_refresh_token();
        let record = self.new_refresh_token(user, Uuid::new_v4(), &refresh_token, Utc::now());
        self.ledger.create_refresh_token(record).await?;
        self.token_pair(user, refresh_token)
    }

    fn new_refresh_token(
        &self,
        user: &User,
        family_id: Uuid,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> NewRefreshToken {
        NewRefreshToken {
            user_id: user.id,
            family_id,
            token_hash: hash_token(refresh_token),
            expires_at: now + Duration::seconds(self.jwt.refresh_token_expiry),
        }
    }

    fn token_pair(&self, user: &User, refresh_token: String) -> Result<TokenPair, AppError> {
        Ok(TokenPair {
            access_token: generate_access_token(&user.id, user.role, &self.jwt)?,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.jwt.access_token_expiry,
        })
    }
}

fn log_failed_login(user: &User, state: LockoutState, now: DateTime<Utc>) {
    if state.is_locked(now) {
        tracing::warn!(
            user_id = %user.id,
            failed_attempts = state.failed_attempts,
            locked_until = ?state.locked_until,
            "Account locked after repeated failed logins"
        );
    } else {
        tracing::info!(user_id = %user.id, failed_attempts = state.failed_attempts, "Failed login");
    }
}
