//! Persistence contracts for the session core
//!
//! `CredentialStore` owns users and their lockout counters,
//! `RefreshTokenLedger` owns refresh-token records grouped into families.
//! The store is the only source of truth: every read-then-write that the
//! session state machine depends on is a single atomic operation here.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AttemptReservation, LockoutState, LoginAttempt};
use crate::error::StoreError;

/// Closed set of roles carried in access-token claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(StoreError::Backend(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub lockout: LockoutState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            role: self.role,
            created_at: self.created_at,
        }
    }
}

/// Public view of a user, safe to return to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// One link of a token family. Only the SHA-256 hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub token_hash: String,
    pub is_revoked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Case-insensitive lookup
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Case-insensitive lookup
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Fails with `StoreError::Conflict` when email or username is taken
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    /// Check the lock and count the attempt as one atomic step.
    ///
    /// Returns `None` if the user does not exist.
    async fn reserve_login_attempt(
        &self,
        user_id: Uuid,
        reservation: AttemptReservation,
        now: DateTime<Utc>,
    ) -> Result<Option<LoginAttempt>, StoreError>;

    /// Clear the counter and any lock after a successful password check,
    /// but only while the state is still `reserved`. Returns false when a
    /// concurrent attempt changed it first.
    async fn clear_login_attempts(
        &self,
        user_id: Uuid,
        reserved: LockoutState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns false if the user does not exist
    async fn update_password_hash(&self, user_id: Uuid, password_hash: &str) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
pub trait RefreshTokenLedger: Send + Sync {
    async fn create_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, StoreError>;

    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Compare-and-set the revoked flag. Returns true only for the call that
    /// flipped it.
    async fn revoke_token(&self, token_id: Uuid) -> Result<bool, StoreError>;

    /// Revoke every record of the family; returns how many were still active
    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError>;

    /// Revoke `current_id` and insert its successor as one atomic step.
    ///
    /// Returns `None` without inserting anything if `current_id` was already
    /// revoked, i.e. a concurrent rotation won.
    async fn rotate_refresh_token(
        &self,
        current_id: Uuid,
        next: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Revoke every family owned by the user
    async fn revoke_user_tokens(&self, user_id: Uuid) -> Result<u64, StoreError>;
}
