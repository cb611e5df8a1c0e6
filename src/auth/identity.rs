//! Account lookup and password verification.
//!
//! Passwords are stored as Argon2id PHC strings. Unknown usernames and wrong
//! passwords are indistinguishable to callers: both verify to `None`.

use crate::rbac::Subject;
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use rand::rngs::OsRng;
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info_span, instrument, Instrument};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
}

impl From<&Principal> for Subject {
    fn from(principal: &Principal) -> Self {
        Self {
            user_id: principal.id,
            is_superuser: principal.is_superuser,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Username {0} is already taken")]
    UsernameTaken(String),
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// The account when `password` matches, `None` otherwise.
    ///
    /// Inactive accounts are returned too; the caller decides what to do
    /// with them.
    async fn verify(&self, username: &str, password: &str)
        -> Result<Option<Principal>, IdentityError>;

    async fn register(&self, username: &str, password: &str) -> Result<Principal, IdentityError>;

    async fn exists(&self, username: &str) -> Result<bool, IdentityError>;

    async fn find(&self, user_id: i64) -> Result<Option<Principal>, IdentityError>;
}

/// 3 to 20 characters of letters, digits, `_` and `-`.
///
/// # Errors
/// Returns the user-facing reason when the username is rejected.
pub fn validate_username(username: &str) -> Result<(), String> {
    let length = username.chars().count();
    if !(3..=20).contains(&length) {
        return Err("Username must be between 3 and 20 characters".to_string());
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Username may only contain letters, digits, underscores and hyphens".to_string(),
        );
    }
    Ok(())
}

/// At least 8 characters with a lowercase letter, an uppercase letter, a
/// digit and a special character.
///
/// # Errors
/// Returns the first unmet requirement.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    let rules = [
        ("[a-z]", "Password must contain a lowercase letter"),
        ("[A-Z]", "Password must contain an uppercase letter"),
        (r"\d", "Password must contain a digit"),
        (r#"[!@#$%^&*(),.?":{}|<>]"#, "Password must contain a special character"),
    ];
    for (pattern, reason) in rules {
        let matched = Regex::new(pattern).map_or(false, |re| re.is_match(password));
        if !matched {
            return Err(reason.to_string());
        }
    }
    Ok(())
}

fn hash_password(argon2: &Argon2<'_>, password: &str) -> Result<String, IdentityError> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| IdentityError::Hash(err.to_string()))
}

/// Argon2id hash with the default cost parameters that no password matches.
/// Unknown usernames are verified against it so they cost as much as a
/// wrong password.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$uEAixLYAhagER4MjlE3fxQ$22DgcpgP2uTgEgJhZSZ9jr8DL21yK+2/RgPjSRiSoZY";

fn burn_verification(argon2: &Argon2<'_>, password: &str) {
    let _ = password_matches(argon2, DUMMY_HASH, password);
}

fn password_matches(argon2: &Argon2<'_>, stored: &str, password: &str) -> bool {
    PasswordHash::new(stored)
        .is_ok_and(|parsed| argon2.verify_password(password.as_bytes(), &parsed).is_ok())
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    is_active: bool,
    is_superuser: bool,
}

impl From<&UserRow> for Principal {
    fn from(row: &UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username.clone(),
            is_active: row.is_active,
            is_superuser: row.is_superuser,
        }
    }
}

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
    argon2: Argon2<'static>,
}

impl PgIdentityStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            argon2: Argon2::default(),
        }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    #[instrument(skip(self, password))]
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Principal>, IdentityError> {
        let query = r"
            SELECT id, username, password_hash, is_active, is_superuser
            FROM users
            WHERE username = $1
        ";
        let row = sqlx::query_as::<_, UserRow>(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT"
            ))
            .await?;

        let Some(row) = row else {
            burn_verification(&self.argon2, password);
            return Ok(None);
        };
        if !password_matches(&self.argon2, &row.password_hash, password) {
            return Ok(None);
        }

        if row.is_active {
            sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
                .bind(row.id)
                .execute(&self.pool)
                .instrument(info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE"
                ))
                .await?;
        }

        Ok(Some(Principal::from(&row)))
    }

    #[instrument(skip(self, password))]
    async fn register(&self, username: &str, password: &str) -> Result<Principal, IdentityError> {
        let password_hash = hash_password(&self.argon2, password)?;
        let query = r"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            RETURNING id, username, password_hash, is_active, is_superuser
        ";
        let row = sqlx::query_as::<_, UserRow>(query)
            .bind(username)
            .bind(&password_hash)
            .fetch_one(&self.pool)
            .instrument(info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT"
            ))
            .await
            .map_err(|err| {
                let unique = err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if unique {
                    IdentityError::UsernameTaken(username.to_string())
                } else {
                    IdentityError::Database(err)
                }
            })?;
        Ok(Principal::from(&row))
    }

    async fn exists(&self, username: &str) -> Result<bool, IdentityError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&self.pool)
                .instrument(info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "SELECT"
                ))
                .await?;
        Ok(exists)
    }

    async fn find(&self, user_id: i64) -> Result<Option<Principal>, IdentityError> {
        let query = r"
            SELECT id, username, password_hash, is_active, is_superuser
            FROM users
            WHERE id = $1
        ";
        let row = sqlx::query_as::<_, UserRow>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT"
            ))
            .await?;
        Ok(row.as_ref().map(Principal::from))
    }
}

/// In-process accounts for tests and local runs.
///
/// Uses minimal Argon2 cost parameters.
pub struct MemoryIdentityStore {
    users: RwLock<HashMap<String, UserRow>>,
    argon2: Argon2<'static>,
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        let params = argon2::Params::new(argon2::Params::MIN_M_COST, 1, 1, None)
            .unwrap_or_default();
        Self {
            users: RwLock::new(HashMap::new()),
            argon2: Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params),
        }
    }

    /// Create or replace an account.
    ///
    /// # Errors
    /// Returns an error if the password cannot be hashed.
    pub async fn insert(
        &self,
        username: &str,
        password: &str,
        is_active: bool,
        is_superuser: bool,
    ) -> Result<Principal, IdentityError> {
        let password_hash = hash_password(&self.argon2, password)?;
        let mut users = self.users.write().await;
        let id = users
            .get(username)
            .map_or_else(|| next_id(&users), |existing| existing.id);
        let row = UserRow {
            id,
            username: username.to_string(),
            password_hash,
            is_active,
            is_superuser,
        };
        let principal = Principal::from(&row);
        users.insert(username.to_string(), row);
        Ok(principal)
    }

    /// Flip the active flag, returns false for unknown users.
    pub async fn set_active(&self, username: &str, is_active: bool) -> bool {
        let mut users = self.users.write().await;
        match users.get_mut(username) {
            Some(row) => {
                row.is_active = is_active;
                true
            }
            None => false,
        }
    }
}

fn next_id(users: &HashMap<String, UserRow>) -> i64 {
    users.values().map(|row| row.id).max().unwrap_or(0) + 1
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Principal>, IdentityError> {
        let users = self.users.read().await;
        let Some(row) = users.get(username) else {
            burn_verification(&self.argon2, password);
            return Ok(None);
        };
        Ok(password_matches(&self.argon2, &row.password_hash, password).then(|| Principal::from(row)))
    }

    async fn register(&self, username: &str, password: &str) -> Result<Principal, IdentityError> {
        let password_hash = hash_password(&self.argon2, password)?;
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(IdentityError::UsernameTaken(username.to_string()));
        }
        let row = UserRow {
            id: next_id(&users),
            username: username.to_string(),
            password_hash,
            is_active: true,
            is_superuser: false,
        };
        let principal = Principal::from(&row);
        users.insert(username.to_string(), row);
        Ok(principal)
    }

    async fn exists(&self, username: &str) -> Result<bool, IdentityError> {
        Ok(self.users.read().await.contains_key(username))
    }

    async fn find(&self, user_id: i64) -> Result<Option<Principal>, IdentityError> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|row| row.id == user_id)
            .map(Principal::from))
    }
}
