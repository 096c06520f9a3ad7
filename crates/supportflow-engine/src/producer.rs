//! Job producer and the in-process dispatcher pool
//!
//! Triggers append to the per-conversation queue (dedup on push) and enqueue
//! drain jobs whose deterministic ids collapse concurrent enqueues. A
//! semaphore-bounded pool of workers consumes the jobs; continuation wakes
//! re-enter through the same dedup.

use crate::drain::DrainWorker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use supportflow_core::{
    AgentId, ConversationId, Direction, DrainJob, EngineConfig, MessageId, Result, SenderType,
};
use supportflow_store::{PauseFlag, TriggerQueue, TriggerOutcome, WorkflowRegistry};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// An incoming trigger from the ingress layer.
#[derive(Clone, Debug)]
pub struct Trigger {
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
    pub sender_type: SenderType,
}

/// Push a job unless one with the same id is already pending or running.
fn enqueue_job(
    tx: &mpsc::Sender<DrainJob>,
    pending: &DashMap<String, ()>,
    job: DrainJob,
) -> bool {
    if pending.insert(job.job_id.clone(), ()).is_some() {
        debug!(job = %job.job_id, "drain job already pending; collapsed");
        return false;
    }
    let job_id = job.job_id.clone();
    match tx.try_send(job) {
        Ok(()) => true,
        Err(e) => {
            pending.remove(&job_id);
            warn!(job = %job_id, "drain job queue full, dropping: {}", e);
            false
        }
    }
}

/// Bounded worker pool consuming drain jobs, with pending-job dedup.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: mpsc::Sender<DrainJob>,
    pending: Arc<DashMap<String, ()>>,
}

impl JobDispatcher {
    pub fn start(
        worker: Arc<DrainWorker>,
        config: &EngineConfig,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DrainJob>(1024);
        let pending: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let dispatcher = Self {
            tx,
            pending: pending.clone(),
        };

        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let lock_duration = config.lock_duration;
        let stalled_interval = config.stalled_interval;
        let max_stalled_count = config.max_stalled_count;
        // Continuations re-enter through a weak sender so the channel closes
        // once the producer side is dropped.
        let weak_tx = dispatcher.tx.downgrade();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = worker.clone();
                let pending = pending.clone();
                let weak_tx = weak_tx.clone();

                tokio::spawn(async move {
                    // Watchdog: a job holding a slot far past its lease gets
                    // logged, not killed; the drain lock TTL is the real cap.
                    let watchdog = {
                        let job_id = job.job_id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(lock_duration).await;
                            let mut probes = 0u32;
                            while probes < max_stalled_count {
                                tokio::time::sleep(stalled_interval).await;
                                probes += 1;
                            }
                            warn!(job = %job_id, "drain job appears stalled");
                        })
                    };

                    let continuation = match worker.run(&job).await {
                        Ok(summary) => {
                            debug!(
                                job = %job.job_id,
                                processed = summary.processed,
                                remaining = summary.remaining,
                                "drain job finished"
                            );
                            summary.continuation
                        }
                        Err(e) => {
                            warn!(job = %job.job_id, "drain job failed: {}", e);
                            None
                        }
                    };

                    watchdog.abort();
                    pending.remove(&job.job_id);
                    if let Some(next) = continuation {
                        match weak_tx.upgrade() {
                            Some(tx) => {
                                enqueue_job(&tx, &pending, next);
                            }
                            None => debug!("dispatcher gone; continuation dropped"),
                        }
                    }
                    drop(permit);
                });
            }
            info!("job dispatcher stopped");
        });

        (dispatcher, handle)
    }

    /// Enqueue unless a job with the same id is already pending or running.
    pub fn enqueue(&self, job: DrainJob) -> bool {
        enqueue_job(&self.tx, &self.pending, job)
    }
}

/// The ingress-facing surface: new messages, supersede, pause/resume, wakes.
pub struct JobProducer {
    db: Arc<dyn supportflow_core::Database>,
    queue: TriggerQueue,
    workflows: WorkflowRegistry,
    pause: PauseFlag,
    dispatcher: JobDispatcher,
}

impl JobProducer {
    pub fn new(
        db: Arc<dyn supportflow_core::Database>,
        queue: TriggerQueue,
        workflows: WorkflowRegistry,
        pause: PauseFlag,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self {
            db,
            queue,
            workflows,
            pause,
            dispatcher,
        }
    }

    /// Queue the message and enqueue a drain job. A public visitor message
    /// arriving while a run is in flight supersedes that run; the queue is
    /// untouched so the replacement drains the full burst.
    pub async fn on_new_message(&self, trigger: &Trigger) -> Result<bool> {
        self.queue
            .push(&trigger.conversation_id, &trigger.message_id)
            .await?;

        if trigger.sender_type == SenderType::Visitor {
            let in_flight = self
                .workflows
                .get(&trigger.conversation_id, Direction::Inbound)
                .await?;
            // Only a strictly newer message preempts; a redelivered trigger
            // must not cancel its own run.
            let newer = in_flight.as_ref().is_some_and(|state| {
                (trigger.message_created_at, trigger.message_id.as_str())
                    > (state.anchor_created_at, state.anchor_message_id.as_str())
            });
            if newer {
                self.supersede(
                    &trigger.conversation_id,
                    Direction::Inbound,
                    &trigger.message_id,
                    trigger.message_created_at,
                )
                .await?;
            }
        }

        let job = DrainJob::for_trigger(
            trigger.conversation_id.clone(),
            trigger.agent_id.clone(),
            trigger.message_id.clone(),
        );
        Ok(self.dispatcher.enqueue(job))
    }

    /// Cancel the in-flight run for a direction and start a replacement
    /// record (anchor preserved). The queue is not cleared.
    pub async fn supersede(
        &self,
        conversation_id: &ConversationId,
        direction: Direction,
        new_message_id: &MessageId,
        new_message_created_at: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        self.workflows
            .trigger_deduplicated(
                conversation_id,
                direction,
                new_message_id,
                new_message_created_at,
            )
            .await
    }

    /// Enqueue a continuation wake unless an equivalent one is pending.
    pub fn wake_continuation(
        &self,
        conversation_id: ConversationId,
        agent_id: AgentId,
        head_id: MessageId,
    ) -> bool {
        self.dispatcher
            .enqueue(DrainJob::for_wake(conversation_id, agent_id, head_id))
    }

    /// Pause the agent: durable timestamp plus the cached flag.
    pub async fn pause_ai(
        &self,
        conversation_id: &ConversationId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.db.update_ai_pause(conversation_id, until).await?;
        self.pause.pause(conversation_id, until).await?;
        info!(conversation = %conversation_id, "ai paused");
        Ok(())
    }

    /// Resume: the next message triggers a fresh drain; pending queue
    /// entries stay where they are until then.
    pub async fn resume_ai(&self, conversation_id: &ConversationId) -> Result<()> {
        self.db.update_ai_pause(conversation_id, None).await?;
        self.pause.resume(conversation_id).await?;
        info!(conversation = %conversation_id, "ai resumed");
        Ok(())
    }
}
