//! Per-trigger failure counter with bounded TTL

use crate::kv::{keys, KvStore};
use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{ConversationId, MessageId, Result};

#[derive(Clone)]
pub struct FailureCounter {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl FailureCounter {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Record one failure and return the running count.
    pub async fn record(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<i64> {
        self.kv
            .incr_ex(&keys::fail(conversation_id, message_id), self.ttl)
            .await
    }

    pub async fn clear(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        self.kv.del(&keys::fail(conversation_id, message_id)).await
    }
}
