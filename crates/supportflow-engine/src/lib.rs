//! supportflow-engine — the conversation drain scheduler and reply pipeline
//!
//! A producer appends trigger message ids into per-conversation queues and
//! enqueues drain jobs. Drain workers take the conversation lock, coalesce
//! visitor bursts, and run the five-stage pipeline (intake → decision →
//! generation → execution → followup), which drives the tool runtime and the
//! language model. The workflow dedup registry supersedes in-flight runs when
//! newer triggers arrive.

pub mod coalesce;
pub mod context;
pub mod decision;
pub mod drain;
pub mod emitter;
pub mod heartbeat;
pub mod pipeline;
pub mod producer;

pub use coalesce::{coalesce_visitor_burst, CoalesceOutcome};
pub use context::{visitor_context_block, BuiltContext, ContextBuilder};
pub use decision::{decide, decide_with_classifier, Decision, DecisionInput};
pub use drain::{DrainSummary, DrainWorker};
pub use emitter::{BufferedEmitter, NullEmitter, RecordingEmitter};
pub use heartbeat::TypingHeartbeat;
pub use pipeline::{Pipeline, PipelineDeps, PipelineInput, PipelineOutcome};
pub use producer::{JobDispatcher, JobProducer, Trigger};

use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{Database, EngineConfig, RealtimeEmitter};
use supportflow_llm::LanguageModel;
use supportflow_store::{
    DrainLock, FailureCounter, KvStore, PauseFlag, TriggerQueue, WorkflowRegistry,
};
use supportflow_tools::ToolRegistry;

/// Fully wired engine: producer for the ingress layer plus the running
/// dispatcher. Dropping the engine stops accepting jobs; in-flight drains
/// finish on their own.
pub struct Engine {
    pub producer: JobProducer,
    dispatcher_handle: tokio::task::JoinHandle<()>,
}

impl Engine {
    pub fn start(
        db: Arc<dyn Database>,
        kv: Arc<dyn KvStore>,
        model: Arc<dyn LanguageModel>,
        classifier: Option<Arc<dyn LanguageModel>>,
        emitter: Arc<dyn RealtimeEmitter>,
        tools: ToolRegistry,
        config: EngineConfig,
    ) -> Self {
        let queue = TriggerQueue::new(kv.clone());
        let lock = DrainLock::new(kv.clone(), config.drain_lock_ttl);
        let failures = FailureCounter::new(kv.clone(), config.failure_ttl);
        let workflows = WorkflowRegistry::new(kv.clone(), config.workflow_ttl);
        let pause = PauseFlag::new(kv);

        let deps = Arc::new(PipelineDeps {
            db: db.clone(),
            emitter,
            model,
            classifier,
            tools: Arc::new(tools),
            workflows: workflows.clone(),
            pause: pause.clone(),
            config: config.clone(),
        });

        let worker = Arc::new(DrainWorker::new(
            deps.clone(),
            queue.clone(),
            lock,
            failures,
        ));
        let (dispatcher, dispatcher_handle) = JobDispatcher::start(worker, &config);
        let producer = JobProducer::new(db, queue, workflows, pause, dispatcher);

        Self {
            producer,
            dispatcher_handle,
        }
    }

    /// Wait for the dispatcher to drain after the producer is dropped.
    pub async fn shutdown(self, grace: Duration) {
        let Engine {
            producer,
            dispatcher_handle,
        } = self;
        drop(producer);
        let _ = tokio::time::timeout(grace, dispatcher_handle).await;
    }
}
