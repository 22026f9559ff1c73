/// Postgres-backed store
///
/// Writes that change a token lineage run inside transactions holding
/// transaction-scoped advisory locks:
///
/// - rotation takes the owner's user lock, then the family lock
/// - `revoke_family` takes the family lock
/// - `revoke_user_tokens` takes the user lock
///
/// A revocation therefore starts its `UPDATE` only after any in-flight
/// rotation has committed its successor, and sees it. Locks are always taken
/// user before family, so the paths cannot deadlock.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{CredentialStore, NewRefreshToken, NewUser, RefreshTokenLedger, RefreshTokenRecord, User};
use crate::auth::{AttemptReservation, LockoutState, LoginAttempt};
use crate::error::StoreError;

/// First key of the two-key advisory locks, one namespace per lineage scope
const USER_LOCK: i32 = 1;
const FAMILY_LOCK: i32 = 2;

const USER_COLUMNS: &str = "id, email, username, password_hash, role, failed_login_attempts, locked_until, created_at, updated_at";
const TOKEN_COLUMNS: &str = "id, user_id, family_id, token_hash, is_revoked, expires_at, created_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    username: String,
    password_hash: String,
    role: String,
    failed_login_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            role: row.role.parse()?,
            lockout: LockoutState {
                failed_attempts: row.failed_login_attempts,
                locked_until: row.locked_until,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    user_id: Uuid,
    family_id: Uuid,
    token_hash: String,
    is_revoked: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<TokenRow> for RefreshTokenRecord {
    fn from(row: TokenRow) -> Self {
        RefreshTokenRecord {
            id: row.id,
            user_id: row.user_id,
            family_id: row.family_id,
            token_hash: row.token_hash,
            is_revoked: row.is_revoked,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `./migrations`
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))
    }

    async fn find_user_where(&self, predicate: &str, value: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
        sqlx::query_as::<_, UserRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    /// Revoke the matching records while holding the advisory lock for `id`
    async fn revoke_serialized(&self, namespace: i32, predicate: &str, id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_lineage(&mut tx, namespace, id).await?;
        let revoked = revoke_where(&mut tx, predicate, id).await?;
        tx.commit().await?;
        Ok(revoked)
    }
}

async fn lock_lineage(tx: &mut Transaction<'_, Postgres>, namespace: i32, id: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2::text))")
        .bind(namespace)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn revoke_where(conn: &mut PgConnection, predicate: &str, id: Uuid) -> Result<u64, StoreError> {
    let query = format!(
        "UPDATE refresh_tokens SET is_revoked = true, revoked_at = $2 WHERE {} AND is_revoked = false",
        predicate
    );
    let result = sqlx::query(&query)
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[async_trait::async_trait]
impl CredentialStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.find_user_where("lower(email) = lower($1)", email).await
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.find_user_where("lower(username) = lower($1)", username).await
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query_as::<_, UserRow>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let query = format!(
            r#"
            INSERT INTO users (id, email, username, password_hash, role, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {}
            "#,
            USER_COLUMNS
        );

        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn reserve_login_attempt(
        &self,
        user_id: Uuid,
        reservation: AttemptReservation,
        now: DateTime<Utc>,
    ) -> Result<Option<LoginAttempt>, StoreError> {
        // Same rules as AttemptReservation::apply. The WHERE clause is the
        // lock gate; concurrent attempts re-check it against the row they
        // waited for, so the count never passes the threshold.
        let row = sqlx::query_as::<_, (i32, Option<DateTime<Utc>>)>(
            r#"
            UPDATE users
            SET failed_login_attempts = CASE
                    WHEN locked_until IS NULL THEN failed_login_attempts + 1
                    ELSE 1
                END,
                locked_until = CASE
                    WHEN $3 > 0
                         AND (CASE WHEN locked_until IS NULL THEN failed_login_attempts + 1 ELSE 1 END) >= $3
                    THEN $4
                    ELSE NULL
                END,
                updated_at = $2
            WHERE id = $1 AND (locked_until IS NULL OR locked_until <= $2)
            RETURNING failed_login_attempts, locked_until
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(reservation.max_failed_attempts)
        .bind(reservation.lock_until)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((failed_attempts, locked_until)) = row {
            return Ok(Some(LoginAttempt::Reserved(LockoutState {
                failed_attempts,
                locked_until,
            })));
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists.then_some(LoginAttempt::Locked))
    }

    async fn clear_login_attempts(
        &self,
        user_id: Uuid,
        reserved: LockoutState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0, locked_until = NULL, updated_at = $4
            WHERE id = $1
              AND failed_login_attempts = $2
              AND locked_until IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(user_id)
        .bind(reserved.failed_attempts)
        .bind(reserved.locked_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_password_hash(&self, user_id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl RefreshTokenLedger for PgStore {
    async fn create_refresh_token(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, StoreError> {
        let query = format!(
            r#"
            INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TOKEN_COLUMNS
        );

        let row = sqlx::query_as::<_, TokenRow>(&query)
            .bind(Uuid::new_v4())
            .bind(token.user_id)
            .bind(token.family_id)
            .bind(&token.token_hash)
            .bind(token.expires_at)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let query = format!("SELECT {} FROM refresh_tokens WHERE token_hash = $1", TOKEN_COLUMNS);
        let row = sqlx::query_as::<_, TokenRow>(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(RefreshTokenRecord::from))
    }

    async fn revoke_token(&self, token_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(revoke_where(&mut conn, "id = $1", token_id).await? == 1)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        self.revoke_serialized(FAMILY_LOCK, "family_id = $1", family_id).await
    }

    async fn rotate_refresh_token(
        &self,
        current_id: Uuid,
        next: NewRefreshToken,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        lock_lineage(&mut tx, USER_LOCK, next.user_id).await?;
        lock_lineage(&mut tx, FAMILY_LOCK, next.family_id).await?;

        let claimed = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = true, revoked_at = $2
            WHERE id = $1 AND is_revoked = false
            "#,
        )
        .bind(current_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !claimed {
            tx.rollback().await?;
            return Ok(None);
        }

        let query = format!(
            r#"
            INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TOKEN_COLUMNS
        );
        let row = sqlx::query_as::<_, TokenRow>(&query)
            .bind(Uuid::new_v4())
            .bind(next.user_id)
            .bind(next.family_id)
            .bind(&next.token_hash)
            .bind(next.expires_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row.into()))
    }

    async fn revoke_user_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.revoke_serialized(USER_LOCK, "user_id = $1", user_id).await
    }
}
