//! Redis-backed suppression store.
//!
//! Each record is a hash at `mailgate:subscription:{email}`. Conditional
//! writes run as Lua scripts so the existence check and the write happen
//! in one step on the server.

use super::{
    StoreError, SubscriptionRecord, SubscriptionUpdate, SuppressionStore, WriteCondition,
    PERMANENT_BOUNCE,
};
use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::{Connection, Pool};
use std::collections::HashMap;
use tracing::{debug, error};

/// Key prefix for subscription hashes
pub const SUBSCRIPTION_KEY_PREFIX: &str = "mailgate:subscription:";

/// `HSET` the record only when the key is absent.
const PUT_IF_ABSENT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
";

/// ARGV[1] is '1' when the record must already exist; the rest are
/// field/value pairs. A stored permanent bounce is never downgraded.
const MERGE_SCRIPT: &str = r"
if ARGV[1] == '1' and redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local fields = {}
for i = 2, #ARGV - 1, 2 do
    local name, value = ARGV[i], ARGV[i + 1]
    if name == 'bounce_type' and redis.call('HGET', KEYS[1], 'bounce_type') == ARGV[#ARGV] then
        value = ARGV[#ARGV]
    end
    table.insert(fields, name)
    table.insert(fields, value)
end
redis.call('HSET', KEYS[1], unpack(fields))
return 1
";

/// Suppression store over a Redis connection pool.
#[derive(Clone)]
pub struct RedisSuppressionStore {
    pool: Pool,
    put_if_absent: Script,
    merge: Script,
}

impl RedisSuppressionStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            put_if_absent: Script::new(PUT_IF_ABSENT_SCRIPT),
            merge: Script::new(MERGE_SCRIPT),
        }
    }

    fn key(email: &str) -> String {
        format!("{SUBSCRIPTION_KEY_PREFIX}{email}")
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for subscription store");
            StoreError::Connection(e.to_string())
        })
    }
}

#[async_trait]
impl SuppressionStore for RedisSuppressionStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, email: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        let mut conn = self.connection().await?;

        let fields: HashMap<String, String> = cmd("HGETALL")
            .arg(Self::key(email))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        SubscriptionRecord::from_fields(email, &fields).map(Some)
    }

    async fn exists(&self, email: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let count: u64 = cmd("EXISTS")
            .arg(Self::key(email))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        Ok(count > 0)
    }

    async fn put_if_absent(&self, record: &SubscriptionRecord) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let mut invocation = self.put_if_absent.key(Self::key(&record.email));
        for (name, value) in record.to_fields() {
            invocation.arg(name).arg(value);
        }

        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        debug!(email = %record.email, written = written == 1, "Stored subscription record");
        Ok(written == 1)
    }

    async fn merge(
        &self,
        email: &str,
        update: &SubscriptionUpdate,
        condition: WriteCondition,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let mut invocation = self.merge.key(Self::key(email));
        invocation.arg(match condition {
            WriteCondition::Always => "0",
            WriteCondition::RecordExists => "1",
        });
        for (name, value) in update.fields() {
            invocation.arg(name).arg(value);
        }
        // Trailing sentinel read by the script, outside the pair loop
        invocation.arg(PERMANENT_BOUNCE);

        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        Ok(applied == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        Ok(())
    }
}
