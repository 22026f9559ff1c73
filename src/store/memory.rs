/// In-memory store
///
/// A single mutex guards users and tokens, so every trait method is
/// linearizable. Used by the test suites and anywhere a Postgres instance is
/// not available.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CredentialStore, NewRefreshToken, NewUser, RefreshTokenLedger, RefreshTokenRecord, User};
use crate::auth::{AttemptReservation, LockoutState, LoginAttempt};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    tokens: HashMap<Uuid, RefreshTokenRecord>,
    token_ids_by_hash: HashMap<String, Uuid>,
}

impl State {
    fn find_user(&self, matches: impl Fn(&User) -> bool) -> Option<User> {
        self.users.values().find(|u| matches(u)).cloned()
    }

    fn insert_token(&mut self, token: NewRefreshToken) -> Result<RefreshTokenRecord, StoreError> {
        if self.token_ids_by_hash.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("token_hash".to_string()));
        }

        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: token.user_id,
            family_id: token.family_id,
            token_hash: token.token_hash,
            is_revoked: false,
            expires_at: token.expires_at,
            created_at: Utc::now(),
        };
        self.token_ids_by_hash.insert(record.token_hash.clone(), record.id);
        self.tokens.insert(record.id, record.clone());
        Ok(record)
    }

    fn revoke_where(&mut self, matches: impl Fn(&RefreshTokenRecord) -> bool) -> u64 {
        let mut revoked = 0;
        for record in self.tokens.values_mut().filter(|r| !r.is_revoked && matches(r)) {
            record.is_revoked = true;
            revoked += 1;
        }
        revoked
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state()?.find_user(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state()?.find_user(|u| u.username.eq_ignore_ascii_case(username)))
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state()?.users.get(&user_id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut state = self.state()?;

        if state.find_user(|u| u.email.eq_ignore_ascii_case(&user.email)).is_some() {
            return Err(StoreError::Conflict("email".to_string()));
        }
        if state.find_user(|u| u.username.eq_ignore_ascii_case(&user.username)).is_some() {
            return Err(StoreError::Conflict("username".to_string()));
        }

        let now = Utc::now();
        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            username: user.username,
            password_hash: user.password_hash,
            role: user.role,
            lockout: LockoutState::default(),
            created_at: now,
            updated_at: now,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn reserve_login_attempt(
        &self,
        user_id: Uuid,
        reservation: AttemptReservation,
        now: DateTime<Utc>,
    ) -> Result<Option<LoginAttempt>, StoreError> {
        let mut state = self.state()?;
        Ok(state.users.get_mut(&user_id).map(|user| {
            let attempt = reservation.apply(&user.lockout, now);
            if let LoginAttempt::Reserved(next) = attempt {
                user.lockout = next;
                user.updated_at = now;
            }
            attempt
        }))
    }

    async fn clear_login_attempts(
        &self,
        user_id: Uuid,
        reserved: LockoutState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.users.get_mut(&user_id) {
            Some(user) if user.lockout == reserved => {
                user.lockout = LockoutState::default();
                user.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_password_hash(&self, user_id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.users.get_mut(&user_id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                user.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl RefreshTokenLedger for InMemoryStore {
    async fn create_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, StoreError> {
        self.state()?.insert_token(token)
    }

    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .token_ids_by_hash
            .get(token_hash)
            .and_then(|id| state.tokens.get(id))
            .cloned())
    }

    async fn revoke_token(&self, token_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state()?.revoke_where(|r| r.id == token_id) == 1)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.state()?.revoke_where(|r| r.family_id == family_id))
    }

    async fn rotate_refresh_token(
        &self,
        current_id: Uuid,
        next: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let mut state = self.state()?;
        if state.token_ids_by_hash.contains_key(&next.token_hash) {
            return Err(StoreError::Conflict("token_hash".to_string()));
        }
        if state.revoke_where(|r| r.id == current_id) == 0 {
            return Ok(None);
        }
        state.insert_token(next).map(Some)
    }

    async fn revoke_user_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.state()?.revoke_where(|r| r.user_id == user_id))
    }
}
