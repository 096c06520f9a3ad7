//! Per-conversation trigger queue
//!
//! An ordered list of pending trigger message ids, unique per message,
//! consumed head-first by the drain worker.

use crate::kv::{keys, KvStore};
use std::sync::Arc;
use supportflow_core::{ConversationId, MessageId, Result};

#[derive(Clone)]
pub struct TriggerQueue {
    kv: Arc<dyn KvStore>,
}

impl TriggerQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Append a trigger. Returns false when the id was already queued.
    pub async fn push(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<bool> {
        self.kv
            .list_push_unique(&keys::queue(conversation_id), message_id.as_str())
            .await
    }

    pub async fn peek(&self, conversation_id: &ConversationId) -> Result<Option<MessageId>> {
        let head = self
            .kv
            .list_range(&keys::queue(conversation_id), 0, 0)
            .await?;
        Ok(head.into_iter().next().map(MessageId::new))
    }

    /// Up to `n` head ids in queue order.
    pub async fn peek_batch(
        &self,
        conversation_id: &ConversationId,
        n: usize,
    ) -> Result<Vec<MessageId>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .kv
            .list_range(&keys::queue(conversation_id), 0, n as isize - 1)
            .await?;
        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    /// Idempotent removal: removing an absent id is a no-op.
    pub async fn remove(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<bool> {
        self.kv
            .list_remove(&keys::queue(conversation_id), message_id.as_str())
            .await
    }

    pub async fn remove_many(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        for id in message_ids {
            self.remove(conversation_id, id).await?;
        }
        Ok(())
    }

    pub async fn len(&self, conversation_id: &ConversationId) -> Result<usize> {
        self.kv.list_len(&keys::queue(conversation_id)).await
    }

    pub async fn is_empty(&self, conversation_id: &ConversationId) -> Result<bool> {
        Ok(self.len(conversation_id).await? == 0)
    }
}
