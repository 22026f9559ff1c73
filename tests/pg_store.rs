//! `PgStore` against a real Postgres; each test gets its own database

use std::time::Duration;

use binlayout::auth::{AttemptReservation, LockoutState, LoginAttempt};
use binlayout::configuration::{get_configuration, DatabaseSettings};
use binlayout::error::StoreError;
use binlayout::store::{CredentialStore, NewRefreshToken, NewUser, PgStore, RefreshTokenLedger, Role};
use chrono::Utc;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use uuid::Uuid;

pub struct TestStore {
    pub store: PgStore,
    pub db_pool: PgPool,
}

async fn spawn_store() -> TestStore {
    let mut configuration = get_configuration().expect("Failed to read configuration.");
    configuration.database.database_name = Uuid::new_v4().to_string();
    let db_pool = configure_database(&configuration.database).await;

    let store = PgStore::new(db_pool.clone());
    store.migrate().await.expect("Failed to migrate the database.");

    TestStore { store, db_pool }
}

pub async fn configure_database(config: &DatabaseSettings) -> PgPool {
    let mut connection = PgConnection::connect(&config.connection_string_without_db())
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"CREATE DATABASE "{}";"#, config.database_name))
        .await
        .expect("Failed to create database.");

    PgPool::connect(&config.connection_string())
        .await
        .expect("Failed to connect to Postgres.")
}

fn new_user(email: &str, username: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        username: username.to_string(),
        password_hash: "$argon2id$placeholder".to_string(),
        role: Role::User,
    }
}

fn new_token(user_id: Uuid, family_id: Uuid, hash: &str) -> NewRefreshToken {
    NewRefreshToken {
        user_id,
        family_id,
        token_hash: hash.to_string(),
        expires_at: Utc::now() + chrono::Duration::days(30),
    }
}

fn reservation(max_failed_attempts: i32, cooldown: chrono::Duration) -> AttemptReservation {
    AttemptReservation {
        max_failed_attempts,
        lock_until: Utc::now() + cooldown,
    }
}

fn reserved(attempt: Option<LoginAttempt>) -> LockoutState {
    match attempt {
        Some(LoginAttempt::Reserved(state)) => state,
        other => panic!("expected a reserved attempt, got {:?}", other),
    }
}

// --- Users ---

#[tokio::test]
async fn email_and_username_are_unique_ignoring_case() {
    let app = spawn_store().await;
    app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();

    let err = app.store.create_user(new_user("A@X.COM", "bob")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(ref f) if f == "email"), "{:?}", err);

    let err = app.store.create_user(new_user("b@x.com", "ALICE")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(ref f) if f == "username"), "{:?}", err);

    let found = app.store.find_user_by_email("A@x.Com").await.unwrap();
    assert_eq!(found.map(|u| u.username), Some("alice".to_string()));
    let found = app.store.find_user_by_username("Alice").await.unwrap();
    assert_eq!(found.map(|u| u.email), Some("a@x.com".to_string()));
}

#[tokio::test]
async fn password_hash_update_reports_missing_user() {
    let app = spawn_store().await;
    let user = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();

    assert!(app.store.update_password_hash(user.id, "new-digest").await.unwrap());
    assert!(!app.store.update_password_hash(Uuid::new_v4(), "new-digest").await.unwrap());

    let user = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(user.password_hash, "new-digest");
}

// --- Lockout ---

#[tokio::test]
async fn reservations_lock_at_threshold_and_stop_counting() {
    let app = spawn_store().await;
    let user = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();
    let now = Utc::now();
    let policy = reservation(3, chrono::Duration::minutes(15));

    for count in 1..=3 {
        let state = reserved(app.store.reserve_login_attempt(user.id, policy, now).await.unwrap());
        assert_eq!(state.failed_attempts, count);
    }

    let attempt = app.store.reserve_login_attempt(user.id, policy, now).await.unwrap();
    assert_eq!(attempt, Some(LoginAttempt::Locked));

    let user = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(user.lockout.failed_attempts, 3);
    assert!(user.lockout.is_locked(now));

    let missing = app
        .store
        .reserve_login_attempt(Uuid::new_v4(), policy, now)
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn expired_lock_restarts_the_count() {
    let app = spawn_store().await;
    let user = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();
    let already_over = reservation(2, chrono::Duration::minutes(-1));

    for _ in 0..2 {
        reserved(app.store.reserve_login_attempt(user.id, already_over, Utc::now()).await.unwrap());
    }

    let state = reserved(
        app.store
            .reserve_login_attempt(user.id, already_over, Utc::now())
            .await
            .unwrap(),
    );
    assert_eq!(state.failed_attempts, 1);
    assert_eq!(state.locked_until, None);
}

#[tokio::test]
async fn stale_success_does_not_clear_a_newer_lock() {
    let app = spawn_store().await;
    let user = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();
    let now = Utc::now();
    let policy = reservation(3, chrono::Duration::minutes(15));

    let early = reserved(app.store.reserve_login_attempt(user.id, policy, now).await.unwrap());
    for _ in 0..2 {
        reserved(app.store.reserve_login_attempt(user.id, policy, now).await.unwrap());
    }

    assert!(!app.store.clear_login_attempts(user.id, early, now).await.unwrap());
    let locked = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
    assert!(locked.lockout.is_locked(now));

    assert!(app.store.clear_login_attempts(user.id, locked.lockout, now).await.unwrap());
    let cleared = app.store.find_user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(cleared.lockout, LockoutState::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_reservations_never_pass_the_threshold() {
    let app = spawn_store().await;
    let user = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();
    let user_id = user.id;
    let policy = reservation(5, chrono::Duration::minutes(15));

    let attempts: Vec<_> = (0..20)
        .map(|_| {
            let store = app.store.clone();
            tokio::spawn(async move { store.reserve_login_attempt(user_id, policy, Utc::now()).await })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        if let Some(LoginAttempt::Reserved(_)) = attempt.await.unwrap().unwrap() {
            granted += 1;
        }
    }

    assert_eq!(granted, 5);
    let user = app.store.find_user_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.lockout.failed_attempts, 5);
}

// --- Refresh tokens ---

#[tokio::test]
async fn rotation_is_compare_and_set() {
    let app = spawn_store().await;
    let user_id = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap().id;
    let family = Uuid::new_v4();
    let first_id = app
        .store
        .create_refresh_token(new_token(user_id, family, "h1"))
        .await
        .unwrap()
        .id;

    let second = app
        .store
        .rotate_refresh_token(first_id, new_token(user_id, family, "h2"))
        .await
        .unwrap()
        .expect("first rotation wins");
    assert_eq!(second.family_id, family);

    let lost = app
        .store
        .rotate_refresh_token(first_id, new_token(user_id, family, "h3"))
        .await
        .unwrap();
    assert!(lost.is_none());
    assert!(app.store.find_refresh_token_by_hash("h3").await.unwrap().is_none());

    let first = app.store.find_refresh_token_by_hash("h1").await.unwrap().unwrap();
    assert!(first.is_revoked);
}

#[tokio::test]
async fn family_and_user_revocation_scope() {
    let app = spawn_store().await;
    let alice = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap();
    let bob = app.store.create_user(new_user("b@x.com", "bob")).await.unwrap();
    let laptop = Uuid::new_v4();
    let phone = Uuid::new_v4();
    app.store.create_refresh_token(new_token(alice.id, laptop, "a1")).await.unwrap();
    app.store.create_refresh_token(new_token(alice.id, phone, "a2")).await.unwrap();
    app.store.create_refresh_token(new_token(bob.id, Uuid::new_v4(), "b1")).await.unwrap();

    assert_eq!(app.store.revoke_family(laptop).await.unwrap(), 1);
    assert!(!app.store.find_refresh_token_by_hash("a2").await.unwrap().unwrap().is_revoked);

    assert_eq!(app.store.revoke_user_tokens(alice.id).await.unwrap(), 1);
    assert!(app.store.find_refresh_token_by_hash("a2").await.unwrap().unwrap().is_revoked);
    assert!(!app.store.find_refresh_token_by_hash("b1").await.unwrap().unwrap().is_revoked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn family_revocation_waits_for_an_inflight_rotation() {
    let app = spawn_store().await;
    let user_id = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap().id;
    let family = Uuid::new_v4();
    let first_id = app
        .store
        .create_refresh_token(new_token(user_id, family, "h1"))
        .await
        .unwrap()
        .id;

    // An uncommitted row holding "h2" parks the rotation on the unique index
    // after it has claimed "h1"
    let mut blocker = app.db_pool.begin().await.unwrap();
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, expires_at, created_at)
        VALUES ($1, $2, $3, 'h2', now() + interval '1 day', now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(Uuid::new_v4())
    .execute(&mut *blocker)
    .await
    .unwrap();

    let rotation = {
        let store = app.store.clone();
        tokio::spawn(async move {
            store
                .rotate_refresh_token(first_id, new_token(user_id, family, "h2"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let revocation = {
        let store = app.store.clone();
        tokio::spawn(async move { store.revoke_family(family).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    blocker.rollback().await.unwrap();

    rotation
        .await
        .unwrap()
        .unwrap()
        .expect("rotation claimed the token before the revocation");
    assert_eq!(revocation.await.unwrap().unwrap(), 1);

    let successor = app.store.find_refresh_token_by_hash("h2").await.unwrap().unwrap();
    assert!(successor.is_revoked, "successor issued during family revocation survived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_revocation_waits_for_an_inflight_rotation() {
    let app = spawn_store().await;
    let user_id = app.store.create_user(new_user("a@x.com", "alice")).await.unwrap().id;
    let family = Uuid::new_v4();
    let first_id = app
        .store
        .create_refresh_token(new_token(user_id, family, "h1"))
        .await
        .unwrap()
        .id;

    let mut blocker = app.db_pool.begin().await.unwrap();
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, expires_at, created_at)
        VALUES ($1, $2, $3, 'h2', now() + interval '1 day', now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(Uuid::new_v4())
    .execute(&mut *blocker)
    .await
    .unwrap();

    let rotation = {
        let store = app.store.clone();
        tokio::spawn(async move {
            store
                .rotate_refresh_token(first_id, new_token(user_id, family, "h2"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let revocation = {
        let store = app.store.clone();
        tokio::spawn(async move { store.revoke_user_tokens(user_id).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    blocker.rollback().await.unwrap();

    rotation.await.unwrap().unwrap().expect("rotation claimed the token first");
    assert_eq!(revocation.await.unwrap().unwrap(), 1);

    let successor = app.store.find_refresh_token_by_hash("h2").await.unwrap().unwrap();
    assert!(successor.is_revoked);
}
