//! Kill-switch: the per-conversation AI pause flag
//!
//! Fast path is a cached store flag; the durable `ai_paused_until` timestamp
//! on the conversation is the fallback when the flag is absent.

use crate::kv::{keys, KvStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{Conversation, ConversationId, Result};

const INDEFINITE_PAUSE: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone)]
pub struct PauseFlag {
    kv: Arc<dyn KvStore>,
}

impl PauseFlag {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Set the cached flag. Without an explicit `until` the flag holds for a
    /// day; resume clears it earlier.
    pub async fn pause(
        &self,
        conversation_id: &ConversationId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let ttl = until
            .and_then(|until| (until - Utc::now()).to_std().ok())
            .unwrap_or(INDEFINITE_PAUSE);
        self.kv
            .set_ex(&keys::pause(conversation_id), "1", ttl)
            .await
    }

    pub async fn resume(&self, conversation_id: &ConversationId) -> Result<()> {
        self.kv.del(&keys::pause(conversation_id)).await
    }

    /// Cached flag only; absent means "not known to be paused".
    pub async fn is_flagged(&self, conversation_id: &ConversationId) -> Result<bool> {
        Ok(self.kv.get(&keys::pause(conversation_id)).await?.is_some())
    }

    /// Flag fast path, falling back to the durable pause timestamp.
    pub async fn is_paused(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.is_flagged(&conversation.id).await? {
            return Ok(true);
        }
        Ok(conversation.is_ai_paused(now))
    }
}
