//! Workflow dedup registry
//!
//! One record per `(conversation, direction)` workflow. A new trigger for a
//! direction with an in-flight run supersedes it: the previous run's
//! cancellation token fires (best effort), a fresh run id is written, and the
//! anchor of the original trigger is preserved so downstream consumers keep
//! filtering against the first trigger's timestamp.
//!
//! The record write happens before the new run id is published anywhere;
//! correctness of cancellation races rests solely on `is_active` guarding
//! side effects.

use crate::kv::{keys, KvStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{ConversationId, Direction, MessageId, Result, RunId, WorkflowState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of `trigger_deduplicated`.
#[derive(Clone, Debug)]
pub struct TriggerOutcome {
    pub run_id: RunId,
    pub is_replacement: bool,
    /// The run that was cancelled, when this trigger superseded one.
    pub superseded_run_id: Option<RunId>,
}

#[derive(Clone)]
pub struct WorkflowRegistry {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    cancels: Arc<DashMap<RunId, CancellationToken>>,
}

impl WorkflowRegistry {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            kv,
            ttl,
            cancels: Arc::new(DashMap::new()),
        }
    }

    pub async fn get(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
    ) -> Result<Option<WorkflowState>> {
        let raw = self
            .kv
            .get(&keys::workflow(conversation_id, direction))
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, state: &WorkflowState) -> Result<()> {
        let key = keys::workflow(&state.conversation_id, state.direction);
        self.kv
            .set_ex(&key, &serde_json::to_string(state)?, self.ttl)
            .await
    }

    pub async fn clear(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
    ) -> Result<()> {
        self.kv
            .del(&keys::workflow(conversation_id, direction))
            .await
    }

    /// Clear only if `run_id` still owns the workflow. Prevents an old run's
    /// cleanup from erasing a replacement's record.
    pub async fn clear_if_active(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
        run_id: &RunId,
    ) -> Result<bool> {
        match self.get(conversation_id, direction).await? {
            Some(state) if &state.run_id == run_id => {
                self.clear(conversation_id, direction).await?;
                self.cancels.remove(run_id);
                Ok(true)
            }
            _ => {
                self.cancels.remove(run_id);
                Ok(false)
            }
        }
    }

    /// Start a run for this trigger, superseding any in-flight run for the
    /// same `(conversation, direction)`. The replacement keeps the original
    /// anchor.
    pub async fn trigger_deduplicated(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
        anchor_message_id: &MessageId,
        anchor_created_at: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        let existing = self.get(conversation_id, direction).await?;
        let now = Utc::now();

        let (anchor_id, anchor_at, created_at, superseded) = match &existing {
            Some(prev) => {
                debug!(
                    conversation = %conversation_id,
                    superseded = %prev.run_id,
                    "superseding in-flight workflow run"
                );
                if let Some(token) = self.cancels.get(&prev.run_id) {
                    token.cancel();
                }
                (
                    prev.anchor_message_id.clone(),
                    prev.anchor_created_at,
                    prev.created_at,
                    Some(prev.run_id.clone()),
                )
            }
            None => (
                anchor_message_id.clone(),
                anchor_created_at,
                now,
                None,
            ),
        };

        let run_id = RunId::new(uuid::Uuid::new_v4().to_string());
        let state = WorkflowState {
            run_id: run_id.clone(),
            anchor_message_id: anchor_id,
            anchor_created_at: anchor_at,
            conversation_id: conversation_id.clone(),
            direction,
            created_at,
            updated_at: now,
        };

        // The record must be visible before anything references the run id.
        self.set(&state).await?;
        self.cancels.insert(run_id.clone(), CancellationToken::new());

        Ok(TriggerOutcome {
            run_id,
            is_replacement: existing.is_some(),
            superseded_run_id: superseded,
        })
    }

    /// True iff the registry still names `run_id` for this workflow.
    pub async fn is_active(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
        run_id: &RunId,
    ) -> Result<bool> {
        Ok(self
            .get(conversation_id, direction)
            .await?
            .is_some_and(|state| &state.run_id == run_id))
    }

    /// Cancellation handle for a run; fires when the run is superseded.
    pub fn cancel_token(&self, run_id: &RunId) -> CancellationToken {
        self.cancels
            .entry(run_id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }
}
