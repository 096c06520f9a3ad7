//! The `KvStore` interface and key layout

use std::time::Duration;
use supportflow_core::Result;

/// Minimal key-value surface the pipeline needs from its shared store.
///
/// Lists preserve insertion order. Locks are single-holder with TTL;
/// re-acquisition by the same holder refreshes the lease.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Increment a counter, setting `ttl` when the key is created.
    /// Returns the new value.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Append to the tail unless the value is already present.
    /// Returns true when appended.
    async fn list_push_unique(&self, key: &str, value: &str) -> Result<bool>;

    /// Inclusive range with Redis semantics (negative indices count from the
    /// tail; `(0, -1)` is the whole list).
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Remove the first occurrence. Returns true when something was removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<bool>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Acquire a single-holder lock. True when this holder owns the lock
    /// afterwards (fresh acquisition or same-holder refresh).
    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease; false when the holder no longer owns the lock.
    async fn lock_renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release if held by `holder`. Returns true when released.
    async fn lock_release(&self, key: &str, holder: &str) -> Result<bool>;
}

/// Key layout shared by every backend.
pub mod keys {
    use supportflow_core::{ConversationId, Direction, MessageId};

    pub fn queue(conversation_id: &ConversationId) -> String {
        format!("ai:queue:{}", conversation_id)
    }

    pub fn lock(conversation_id: &ConversationId) -> String {
        format!("ai:lock:{}", conversation_id)
    }

    pub fn pause(conversation_id: &ConversationId) -> String {
        format!("ai:pause:{}", conversation_id)
    }

    pub fn fail(conversation_id: &ConversationId, message_id: &MessageId) -> String {
        format!("ai:fail:{}:{}", conversation_id, message_id)
    }

    pub fn workflow(conversation_id: &ConversationId, direction: Direction) -> String {
        format!(
            "workflow:message:{}:{}",
            conversation_id,
            direction.as_str()
        )
    }
}
