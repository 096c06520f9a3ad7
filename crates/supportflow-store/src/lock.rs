//! Per-conversation drain lock
//!
//! Single holder, bounded TTL, fenced by the drain job id. Renewal failure
//! means another worker may own the conversation: the drain loop must exit
//! without further side effects.

use crate::kv::{keys, KvStore};
use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{ConversationId, Result};

#[derive(Clone)]
pub struct DrainLock {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl DrainLock {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn acquire(&self, conversation_id: &ConversationId, holder: &str) -> Result<bool> {
        self.kv
            .lock_acquire(&keys::lock(conversation_id), holder, self.ttl)
            .await
    }

    pub async fn renew(&self, conversation_id: &ConversationId, holder: &str) -> Result<bool> {
        self.kv
            .lock_renew(&keys::lock(conversation_id), holder, self.ttl)
            .await
    }

    pub async fn release(&self, conversation_id: &ConversationId, holder: &str) -> Result<bool> {
        self.kv
            .lock_release(&keys::lock(conversation_id), holder)
            .await
    }
}
