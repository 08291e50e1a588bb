//! Identity store: user rows created when an account is confirmed.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Key prefix for user hashes in Redis
pub const USER_KEY_PREFIX: &str = "mailgate:user:";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity store connection error: {0}")]
    Connection(String),

    #[error("identity store command error: {0}")]
    Command(String),
}

/// A created user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    /// User name assigned by the external identity provider
    pub external_user_name: String,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create a user row with a fresh id. Duplicates are not detected here.
    async fn create_user(&self, email: &str, external_user_name: &str) -> Result<Uuid, IdentityError>;
}

/// Process-local identity store.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    users: RwLock<Vec<UserRecord>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of created users, in creation order
    pub async fn users(&self) -> Vec<UserRecord> {
        self.users.read().await.clone()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn create_user(&self, email: &str, external_user_name: &str) -> Result<Uuid, IdentityError> {
        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            external_user_name: external_user_name.to_string(),
        };
        let id = user.id;
        self.users.write().await.push(user);
        Ok(id)
    }
}

/// Identity store keeping one hash per user at `mailgate:user:{id}`.
#[derive(Clone)]
pub struct RedisIdentityStore {
    pool: Pool,
}

impl RedisIdentityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for RedisIdentityStore {
    async fn create_user(&self, email: &str, external_user_name: &str) -> Result<Uuid, IdentityError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| IdentityError::Connection(e.to_string()))?;

        let id = Uuid::new_v4();
        let _: i64 = cmd("HSET")
            .arg(format!("{USER_KEY_PREFIX}{id}"))
            .arg("id")
            .arg(id.to_string())
            .arg("email")
            .arg(email)
            .arg("external_user_name")
            .arg(external_user_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::Command(e.to_string()))?;

        info!(user_id = %id, email = %email, "Created user");
        Ok(id)
    }
}
