//! Drain worker — one conversation, one lock, one bounded loop
//!
//! A drain acquires the per-conversation lock fenced by the job id, hydrates
//! the queue from the DB cursor if needed, and consumes triggers head-first:
//! coalesce, run the pipeline, advance the cursor, dequeue, renew the lock.
//! The loop is bounded by message count and wall clock; leftover work is
//! handed to a continuation wake job.
//!
//! Nothing below this layer crosses the lock boundary with an error: the
//! pipeline reports structured outcomes and the drain is the single
//! escalation point.

use crate::coalesce::coalesce_visitor_burst;
use crate::pipeline::{Pipeline, PipelineDeps, PipelineInput, PipelineOutcome};
use chrono::Utc;
use std::sync::Arc;
use supportflow_core::{
    Conversation, Cursor, DrainJob, Direction, EventRouting, MessageId, OutboundEvent, Result,
    WorkflowStatus,
};
use supportflow_store::{DrainLock, FailureCounter, TriggerQueue};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How many consecutive superseded iterations before the drain yields the
/// conversation to the replacement job.
const MAX_SUPERSEDED_ITERATIONS: u32 = 3;

#[derive(Debug, Default)]
pub struct DrainSummary {
    pub processed: usize,
    pub remaining: usize,
    /// Continuation wake job for leftover queue entries; the dispatcher
    /// enqueues it with its usual dedup.
    pub continuation: Option<DrainJob>,
}

pub struct DrainWorker {
    deps: Arc<PipelineDeps>,
    queue: TriggerQueue,
    lock: DrainLock,
    failures: FailureCounter,
    pipeline: Pipeline,
}

impl DrainWorker {
    pub fn new(
        deps: Arc<PipelineDeps>,
        queue: TriggerQueue,
        lock: DrainLock,
        failures: FailureCounter,
    ) -> Self {
        let pipeline = Pipeline::new(deps.clone());
        Self {
            deps,
            queue,
            lock,
            failures,
            pipeline,
        }
    }

    pub async fn run(&self, job: &DrainJob) -> Result<DrainSummary> {
        if !self
            .lock
            .acquire(&job.conversation_id, &job.job_id)
            .await?
        {
            debug!(
                conversation = %job.conversation_id,
                "drain lock busy; another worker owns this conversation"
            );
            return Ok(DrainSummary::default());
        }

        let result = self.drain_locked(job).await;

        if let Err(e) = self.lock.release(&job.conversation_id, &job.job_id).await {
            warn!(conversation = %job.conversation_id, "lock release failed: {}", e);
        }
        result
    }

    async fn drain_locked(&self, job: &DrainJob) -> Result<DrainSummary> {
        let deps = &self.deps;
        let config = &deps.config;
        let started = Instant::now();

        let conversation = match deps.db.conversation_by_id(&job.conversation_id).await? {
            Some(c) => c,
            None => {
                warn!(conversation = %job.conversation_id, "drain: conversation not found");
                return Ok(DrainSummary::default());
            }
        };
        let routing = EventRouting::from_conversation(&conversation);

        if deps.pause.is_paused(&conversation, Utc::now()).await? {
            // Kill-switch at drain entry: keep the queue for resume.
            deps.emitter.emit(OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Skipped,
                None,
                Some("ai paused".to_string()),
            ));
            return Ok(DrainSummary {
                remaining: self.queue.len(&conversation.id).await?,
                ..Default::default()
            });
        }

        // Seen marker, exactly once per drain.
        deps.emitter
            .emit(OutboundEvent::conversation_seen(routing.clone()));
        if config.update_seen_on_skip {
            deps.db
                .mark_conversation_seen(&conversation.id, Utc::now())
                .await?;
        }

        let mut cursor = conversation.cursor();
        self.hydrate_if_empty(&conversation, cursor.as_ref()).await?;

        let mut processed = 0usize;
        let mut lock_ok = true;
        let mut paused = false;
        let mut superseded_streak = 0u32;

        while processed < config.drain_max_messages
            && started.elapsed() < config.drain_max_runtime
        {
            if deps.pause.is_paused(&conversation, Utc::now()).await? {
                paused = true;
                break;
            }

            let head_id = match self.queue.peek(&conversation.id).await? {
                Some(id) => id,
                None => break,
            };

            let meta = match deps.db.message_meta(&head_id).await? {
                Some(meta) => meta,
                None => {
                    // Deleted or phantom entry.
                    self.queue.remove(&conversation.id, &head_id).await?;
                    continue;
                }
            };

            let already_processed = cursor.as_ref().is_some_and(|c| c.covers(&meta));
            if already_processed || !meta.is_triggerable() {
                self.queue.remove(&conversation.id, &head_id).await?;
                continue;
            }

            let batch =
                coalesce_visitor_burst(deps.db.as_ref(), &self.queue, config, &meta).await?;
            let effective = batch.effective;
            let coalesced = batch.coalesced;

            let outcome = deps
                .workflows
                .trigger_deduplicated(
                    &conversation.id,
                    Direction::Inbound,
                    &effective.id,
                    effective.created_at,
                )
                .await?;
            deps.emitter.emit(OutboundEvent::workflow_started(
                routing.clone(),
                outcome.run_id.clone(),
            ));

            let input = PipelineInput {
                conversation_id: conversation.id.clone(),
                agent_id: job.agent_id.clone(),
                effective: effective.clone(),
                coalesced_count: coalesced.len(),
                run_id: outcome.run_id,
                direction: Direction::Inbound,
            };

            match self.pipeline.run(&input).await {
                PipelineOutcome::Success { .. } => {
                    superseded_streak = 0;
                    // The pipeline advanced the cursor in its followup stage;
                    // dequeue under the same lock.
                    cursor = Some(effective.cursor());
                    self.queue.remove_many(&conversation.id, &coalesced).await?;
                    processed += coalesced.len();
                    self.failures.clear(&conversation.id, &effective.id).await?;
                    if !self.lock.renew(&conversation.id, &job.job_id).await? {
                        // The lease is gone; stop without further side effects.
                        warn!(conversation = %conversation.id, "drain lock renewal failed");
                        lock_ok = false;
                        break;
                    }
                }
                PipelineOutcome::Skipped { reason } => {
                    superseded_streak = 0;
                    debug!(conversation = %conversation.id, %reason, "trigger skipped");
                    cursor = Some(effective.cursor());
                    self.advance_cursor(&conversation, cursor.as_ref()).await?;
                    self.queue.remove_many(&conversation.id, &coalesced).await?;
                    processed += coalesced.len();
                    if !self.lock.renew(&conversation.id, &job.job_id).await? {
                        lock_ok = false;
                        break;
                    }
                }
                PipelineOutcome::Paused => {
                    paused = true;
                    break;
                }
                PipelineOutcome::Superseded => {
                    superseded_streak += 1;
                    if superseded_streak >= MAX_SUPERSEDED_ITERATIONS {
                        // Yield; the replacement trigger's own job drains next.
                        break;
                    }
                    continue;
                }
                outcome @ PipelineOutcome::Failed { .. } => {
                    superseded_streak = 0;
                    let count = self
                        .failures
                        .record(&conversation.id, &effective.id)
                        .await?;
                    if outcome.is_retryable() && count < config.retry_threshold as i64 {
                        // Preserve the head; the continuation job retries it.
                        info!(
                            conversation = %conversation.id,
                            trigger = %effective.id,
                            attempt = count,
                            "transient pipeline failure; will retry"
                        );
                        break;
                    }
                    warn!(
                        conversation = %conversation.id,
                        trigger = %effective.id,
                        attempts = count,
                        "dropping trigger after failure"
                    );
                    cursor = Some(effective.cursor());
                    self.advance_cursor(&conversation, cursor.as_ref()).await?;
                    self.queue.remove_many(&conversation.id, &coalesced).await?;
                    processed += coalesced.len();
                }
            }
        }

        let remaining = self.queue.len(&conversation.id).await?;
        let continuation = if remaining > 0 && !paused && lock_ok {
            self.next_wake(job, &conversation.id).await?
        } else {
            None
        };

        info!(
            conversation = %conversation.id,
            processed,
            remaining,
            "drain finished"
        );
        Ok(DrainSummary {
            processed,
            remaining,
            continuation,
        })
    }

    async fn hydrate_if_empty(
        &self,
        conversation: &Conversation,
        cursor: Option<&Cursor>,
    ) -> Result<()> {
        if !self.queue.is_empty(&conversation.id).await? {
            return Ok(());
        }
        let metas = self
            .deps
            .db
            .messages_after_cursor(&conversation.id, cursor, self.deps.config.hydrate_page_limit)
            .await?;
        if metas.is_empty() {
            return Ok(());
        }
        debug!(
            conversation = %conversation.id,
            count = metas.len(),
            "hydrated queue from cursor"
        );
        for meta in metas {
            self.queue.push(&conversation.id, &meta.id).await?;
        }
        Ok(())
    }

    async fn advance_cursor(
        &self,
        conversation: &Conversation,
        cursor: Option<&Cursor>,
    ) -> Result<()> {
        if let Some(cursor) = cursor {
            self.deps
                .db
                .update_ai_cursor(&conversation.id, cursor)
                .await?;
        }
        Ok(())
    }

    async fn next_wake(
        &self,
        job: &DrainJob,
        conversation_id: &supportflow_core::ConversationId,
    ) -> Result<Option<DrainJob>> {
        let head: Option<MessageId> = self.queue.peek(conversation_id).await?;
        Ok(head.map(|head| {
            DrainJob::for_wake(conversation_id.clone(), job.agent_id.clone(), head)
        }))
    }
}
