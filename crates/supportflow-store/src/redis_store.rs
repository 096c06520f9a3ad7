//! Redis-backed `KvStore`
//!
//! Holds one long-lived multiplexed connection. Compare-and-set operations
//! (lock renew/release, unique push) run as Lua scripts so they stay atomic
//! across the worker fleet.

use crate::kv::KvStore;
use redis::AsyncCommands;
use std::time::Duration;
use supportflow_core::{Error, Result};

pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
    acquire_script: redis::Script,
    renew_script: redis::Script,
    release_script: redis::Script,
    push_unique_script: redis::Script,
    incr_script: redis::Script,
}

fn store_err(e: redis::RedisError) -> Error {
    Error::store(e.to_string())
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_err)?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: redis::aio::MultiplexedConnection) -> Self {
        Self {
            connection,
            acquire_script: redis::Script::new(
                r#"
                local cur = redis.call('GET', KEYS[1])
                if cur == false or cur == ARGV[1] then
                    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
                    return 1
                end
                return 0
                "#,
            ),
            renew_script: redis::Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    redis.call('PEXPIRE', KEYS[1], ARGV[2])
                    return 1
                end
                return 0
                "#,
            ),
            release_script: redis::Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    redis.call('DEL', KEYS[1])
                    return 1
                end
                return 0
                "#,
            ),
            push_unique_script: redis::Script::new(
                r#"
                if redis.call('LPOS', KEYS[1], ARGV[1]) then
                    return 0
                end
                redis.call('RPUSH', KEYS[1], ARGV[1])
                return 1
                "#,
            ),
            incr_script: redis::Script::new(
                r#"
                local v = redis.call('INCR', KEYS[1])
                if v == 1 then
                    redis.call('PEXPIRE', KEYS[1], ARGV[1])
                end
                return v
                "#,
            ),
        }
    }

    fn conn(&self) -> redis::aio::MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait::async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn().get(key).await.map_err(store_err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(store_err)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.conn().del::<_, ()>(key).await.map_err(store_err)
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.incr_script
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)
    }

    async fn list_push_unique(&self, key: &str, value: &str) -> Result<bool> {
        let appended: i64 = self
            .push_unique_script
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(appended == 1)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.conn()
            .lrange(key, start, stop)
            .await
            .map_err(store_err)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool> {
        let removed: i64 = self
            .conn()
            .lrem(key, 1, value)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.conn().llen(key).await.map_err(store_err)
    }

    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired: i64 = self
            .acquire_script
            .key(key)
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(acquired == 1)
    }

    async fn lock_renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let renewed: i64 = self
            .renew_script
            .key(key)
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(renewed == 1)
    }

    async fn lock_release(&self, key: &str, holder: &str) -> Result<bool> {
        let released: i64 = self
            .release_script
            .key(key)
            .arg(holder)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }
}
