//! Tests for supportflow-engine: heartbeat, context, decision, coalescing,
//! drain scenarios, and the wired engine

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use supportflow_core::*;
use supportflow_engine::*;
use supportflow_llm::{GenerateResponse, ScriptedModel, ToolInvocation};
use supportflow_store::*;
use supportflow_tools::create_default_registry;

/// Message timestamps sit just before "now" so fresh triggers do not trip
/// the proactive-wait rule, while still being deterministic within a test
/// process.
fn ts(seconds: i64) -> chrono::DateTime<Utc> {
    static BASE: OnceLock<chrono::DateTime<Utc>> = OnceLock::new();
    let base = *BASE.get_or_init(|| Utc::now() - chrono::Duration::seconds(60));
    base + chrono::Duration::seconds(seconds)
}

fn conv_id() -> ConversationId {
    ConversationId::new("c1")
}

fn agent_id() -> AgentId {
    AgentId::new("a1")
}

fn conversation() -> Conversation {
    Conversation {
        id: conv_id(),
        organization_id: OrganizationId::new("org1"),
        website_id: WebsiteId::new("web1"),
        visitor_id: Some(VisitorId::new("v1")),
        status: ConversationStatus::Open,
        title: None,
        priority: None,
        sentiment: None,
        ai_paused_until: None,
        ai_last_processed_message_id: None,
        ai_last_processed_message_created_at: None,
        assigned_user_ids: Vec::new(),
    }
}

fn support_agent() -> AiAgent {
    AiAgent {
        id: agent_id(),
        model: "claude-haiku-4-5".into(),
        base_prompt: "You are a helpful support agent.".into(),
        temperature: Some(0.3),
        max_output_tokens: Some(1024),
        is_active: true,
        metadata: AgentMetadata::default(),
        behavior: BehaviorSettings {
            can_resolve: true,
            can_mark_spam: false,
            can_set_priority: true,
            can_escalate: true,
            auto_generate_title: true,
            auto_analyze_sentiment: true,
        },
    }
}

fn message(id: &str, seconds: i64, sender: SenderType, body: &str) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: conv_id(),
        created_at: ts(seconds),
        sender_type: sender,
        visibility: Visibility::Public,
        body_markdown: body.to_string(),
    }
}

/// Everything a drain test needs, wired over in-memory fakes.
struct Harness {
    db: Arc<MemoryDatabase>,
    emitter: Arc<RecordingEmitter>,
    model: Arc<ScriptedModel>,
    queue: TriggerQueue,
    lock: DrainLock,
    workflows: WorkflowRegistry,
    pause: PauseFlag,
    worker: DrainWorker,
    config: EngineConfig,
}

fn harness() -> Harness {
    harness_with_classifier(None)
}

fn harness_with_classifier(classifier: Option<Arc<ScriptedModel>>) -> Harness {
    let db = Arc::new(MemoryDatabase::new());
    db.seed_conversation(conversation());
    db.seed_agent(support_agent());

    let kv: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let emitter = Arc::new(RecordingEmitter::new());
    let model = Arc::new(ScriptedModel::new());

    let config = EngineConfig {
        visitor_debounce: Duration::from_millis(1),
        heartbeat_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    };

    let queue = TriggerQueue::new(kv.clone());
    let lock = DrainLock::new(kv.clone(), config.drain_lock_ttl);
    let failures = FailureCounter::new(kv.clone(), config.failure_ttl);
    let workflows = WorkflowRegistry::new(kv.clone(), config.workflow_ttl);
    let pause = PauseFlag::new(kv);

    let classifier: Option<Arc<dyn supportflow_llm::LanguageModel>> = match classifier {
        Some(c) => Some(c),
        None => None,
    };
    let deps = Arc::new(PipelineDeps {
        db: db.clone(),
        emitter: emitter.clone(),
        model: model.clone(),
        classifier,
        tools: Arc::new(create_default_registry()),
        workflows: workflows.clone(),
        pause: pause.clone(),
        config: config.clone(),
    });

    let worker = DrainWorker::new(deps, queue.clone(), lock.clone(), failures);

    Harness {
        db,
        emitter,
        model,
        queue,
        lock,
        workflows,
        pause,
        worker,
        config,
    }
}

impl Harness {
    async fn enqueue_visitor(&self, id: &str, seconds: i64, body: &str) {
        self.db
            .seed_message(message(id, seconds, SenderType::Visitor, body));
        self.queue.push(&conv_id(), &MessageId::new(id)).await.unwrap();
    }

    fn job(&self, trigger: &str) -> DrainJob {
        DrainJob::for_trigger(conv_id(), agent_id(), MessageId::new(trigger))
    }

    fn cursor(&self) -> Option<Cursor> {
        self.db.conversation(&conv_id()).unwrap().cursor()
    }

    fn ai_messages(&self) -> Vec<Message> {
        self.db
            .conversation_messages(&conv_id())
            .into_iter()
            .filter(|m| m.sender_type == SenderType::AiAgent)
            .collect()
    }

    fn completions(&self) -> Vec<OutboundEvent> {
        self.emitter
            .filtered(|k| matches!(k, EventKind::WorkflowCompleted { .. }))
    }
}

// ===========================================================================
// Typing heartbeat
// ===========================================================================

struct FlakyEmitter {
    fail_first: AtomicUsize,
    inner: RecordingEmitter,
}

impl FlakyEmitter {
    fn failing(n: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(n),
            inner: RecordingEmitter::new(),
        }
    }
}

impl RealtimeEmitter for FlakyEmitter {
    fn emit(&self, event: OutboundEvent) -> bool {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return false;
        }
        self.inner.emit(event)
    }
}

fn typing_events(events: &[OutboundEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Typing { is_typing } => Some(is_typing),
            _ => None,
        })
        .collect()
}

fn routing() -> EventRouting {
    EventRouting::from_conversation(&conversation())
}

#[tokio::test]
async fn heartbeat_start_is_idempotent_and_stop_pairs_once() {
    let emitter = Arc::new(RecordingEmitter::new());
    let heartbeat = TypingHeartbeat::new(emitter.clone(), Some(routing()), Duration::from_secs(60));

    heartbeat.start().await;
    heartbeat.start().await; // no-op while running
    heartbeat.stop().await;
    heartbeat.stop().await; // no-op once stopped

    let typing = typing_events(&emitter.events());
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn heartbeat_stop_without_start_emits_nothing() {
    let emitter = Arc::new(RecordingEmitter::new());
    let heartbeat = TypingHeartbeat::new(emitter.clone(), Some(routing()), Duration::from_secs(60));

    heartbeat.stop().await;
    assert!(typing_events(&emitter.events()).is_empty());
}

#[tokio::test]
async fn heartbeat_ticks_while_running() {
    let emitter = Arc::new(RecordingEmitter::new());
    let heartbeat =
        TypingHeartbeat::new(emitter.clone(), Some(routing()), Duration::from_millis(20));

    heartbeat.start().await;
    tokio::time::sleep(Duration::from_millis(70)).await;
    heartbeat.stop().await;

    let typing = typing_events(&emitter.events());
    assert!(typing.len() >= 3, "expected ticks, got {:?}", typing);
    assert!(typing[..typing.len() - 1].iter().all(|t| *t));
    assert_eq!(typing.last(), Some(&false));
}

#[tokio::test]
async fn heartbeat_stop_retries_through_transient_failures() {
    let emitter = Arc::new(FlakyEmitter::failing(0));
    let heartbeat = TypingHeartbeat::new(emitter.clone(), Some(routing()), Duration::from_secs(60));
    heartbeat.start().await;

    // The next two emits fail; stop retries and lands the third.
    emitter.fail_first.store(2, Ordering::SeqCst);
    heartbeat.stop().await;

    let typing = typing_events(&emitter.inner.events());
    assert_eq!(typing.last(), Some(&false));
}

#[tokio::test]
async fn heartbeat_missing_routing_suppresses_emission() {
    let emitter = Arc::new(RecordingEmitter::new());
    let heartbeat = TypingHeartbeat::new(emitter.clone(), None, Duration::from_secs(60));

    heartbeat.start().await;
    heartbeat.stop().await;
    assert!(emitter.events().is_empty());
}

// ===========================================================================
// Context builder
// ===========================================================================

#[tokio::test]
async fn context_maps_roles_and_drops_empty_bodies() {
    let db = MemoryDatabase::new();
    db.seed_message(message("m1", 1, SenderType::Visitor, "Hi"));
    db.seed_message(message("m2", 2, SenderType::AiAgent, "Hello! How can I help?"));
    db.seed_message(message("m3", 3, SenderType::HumanAgent, "Taking over."));
    db.seed_message(message("m4", 4, SenderType::Visitor, "   "));

    let built = ContextBuilder::new(20)
        .build(&db, &conversation(), None)
        .await
        .unwrap();

    let rendered: Vec<(supportflow_llm::ChatRole, &str)> = built
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        rendered,
        vec![
            (supportflow_llm::ChatRole::User, "Hi"),
            (supportflow_llm::ChatRole::Assistant, "Hello! How can I help?"),
            (supportflow_llm::ChatRole::Assistant, "Taking over."),
        ]
    );
    assert!(built.visitor_block.is_empty());
}

#[tokio::test]
async fn context_bounds_history_to_newest_messages() {
    let db = MemoryDatabase::new();
    for i in 0..30 {
        db.seed_message(message(
            &format!("m{:02}", i),
            i,
            SenderType::Visitor,
            &format!("message {}", i),
        ));
    }

    let built = ContextBuilder::new(20)
        .build(&db, &conversation(), None)
        .await
        .unwrap();
    assert_eq!(built.messages.len(), 20);
    // Oldest retained message is number 10, and order is chronological.
    assert_eq!(built.messages[0].content, "message 10");
    assert_eq!(built.messages[19].content, "message 29");
}

#[test]
fn visitor_block_omits_missing_fields() {
    let visitor = Visitor {
        id: Some(VisitorId::new("v1")),
        name: Some("Ada".into()),
        email: None,
        city: Some("Lisbon".into()),
        country: Some("Portugal".into()),
        language: None,
        timezone: Some("Europe/Lisbon".into()),
        browser: None,
        device: None,
    };
    let block = visitor_context_block(&visitor);
    assert!(block.starts_with("## Visitor context"));
    assert!(block.contains("- Name: Ada"));
    assert!(block.contains("- Location: Lisbon, Portugal"));
    assert!(block.contains("- Timezone: Europe/Lisbon"));
    assert!(!block.contains("Email"));
    assert!(!block.contains("Browser"));
}

#[test]
fn visitor_block_empty_when_nothing_known() {
    assert_eq!(visitor_context_block(&Visitor::default()), "");
}

// ===========================================================================
// Decision rules
// ===========================================================================

fn decision_input<'a>(
    conversation: &'a Conversation,
    agent: &'a AiAgent,
    trigger: &'a MessageMeta,
    body: &'a str,
    history: &'a [Message],
) -> DecisionInput<'a> {
    DecisionInput {
        conversation,
        agent,
        trigger,
        trigger_body: body,
        history,
        coalesced_count: 1,
        proactive_wait: Duration::from_secs(300),
        now: ts(10),
    }
}

#[test]
fn human_assignee_silences_the_agent() {
    let mut c = conversation();
    c.assigned_user_ids.push(UserId::new("u1"));
    let agent = support_agent();
    let trigger = message("m1", 1, SenderType::Visitor, "hello").meta();
    let history = vec![message("m1", 1, SenderType::Visitor, "hello")];

    let decision = decide(&decision_input(&c, &agent, &trigger, "hello", &history));
    assert!(!decision.should_act);
    assert_eq!(decision.mode, ResponseMode::Silent);
}

#[test]
fn non_visitor_triggers_are_silent() {
    let c = conversation();
    let agent = support_agent();
    let trigger = message("m1", 1, SenderType::HumanAgent, "internal note").meta();
    let history = vec![message("m1", 1, SenderType::HumanAgent, "internal note")];

    let decision = decide(&decision_input(&c, &agent, &trigger, "internal note", &history));
    assert!(!decision.should_act);
}

#[test]
fn asking_for_a_human_is_recognized() {
    let c = conversation();
    let agent = support_agent();
    let trigger = message("m1", 1, SenderType::Visitor, "x").meta();
    let history = vec![message("m1", 1, SenderType::Visitor, "x")];

    for phrase in [
        "Can I talk to a human?",
        "I want to speak with an agent",
        "give me a real person please",
        "HUMAN SUPPORT now",
    ] {
        let decision = decide(&decision_input(&c, &agent, &trigger, phrase, &history));
        assert!(decision.should_act, "{}", phrase);
        assert_eq!(decision.reason, "visitor asked for a human", "{}", phrase);
    }
}

#[test]
fn batched_reason_reports_coalesced_count() {
    let c = conversation();
    let agent = support_agent();
    let trigger = message("m3", 3, SenderType::Visitor, "It's urgent").meta();
    let history = vec![
        message("m1", 1, SenderType::Visitor, "Hi"),
        message("m2", 2, SenderType::Visitor, "Can you help?"),
        message("m3", 3, SenderType::Visitor, "It's urgent"),
    ];

    let mut input = decision_input(&c, &agent, &trigger, "It's urgent", &history);
    input.coalesced_count = 3;
    let decision = decide(&input);
    assert!(decision.should_act);
    assert!(decision.reason.contains("batched 3 visitor messages"));
}

#[test]
fn waiting_visitor_goes_proactive() {
    let c = conversation();
    let agent = support_agent();
    let trigger = message("m1", 1, SenderType::Visitor, "anyone there?").meta();
    let history = vec![message("m1", 1, SenderType::Visitor, "anyone there?")];

    let mut input = decision_input(&c, &agent, &trigger, "anyone there?", &history);
    input.now = ts(1 + 301); // waited past the 5 minute threshold
    let decision = decide(&input);
    assert!(decision.should_act);
    assert_eq!(decision.mode, ResponseMode::ProactiveReply);
}

// ===========================================================================
// Coalescing
// ===========================================================================

#[tokio::test]
async fn coalesce_merges_consecutive_visitor_messages() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hi").await;
    h.enqueue_visitor("m2", 2, "Can you help?").await;
    h.enqueue_visitor("m3", 3, "It's urgent").await;

    let head = message("m1", 1, SenderType::Visitor, "Hi").meta();
    let outcome = coalesce_visitor_burst(h.db.as_ref(), &h.queue, &h.config, &head)
        .await
        .unwrap();
    assert_eq!(outcome.effective.id, MessageId::new("m3"));
    assert_eq!(
        outcome.coalesced,
        vec![MessageId::new("m1"), MessageId::new("m2"), MessageId::new("m3")]
    );
}

#[tokio::test]
async fn coalesce_stops_at_non_visitor_message() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hi").await;
    h.db
        .seed_message(message("m2", 2, SenderType::HumanAgent, "on it"));
    h.queue.push(&conv_id(), &MessageId::new("m2")).await.unwrap();
    h.enqueue_visitor("m3", 3, "also this").await;

    let head = message("m1", 1, SenderType::Visitor, "Hi").meta();
    let outcome = coalesce_visitor_burst(h.db.as_ref(), &h.queue, &h.config, &head)
        .await
        .unwrap();
    assert_eq!(outcome.effective.id, MessageId::new("m1"));
    assert_eq!(outcome.coalesced, vec![MessageId::new("m1")]);
}

#[tokio::test]
async fn coalesce_respects_batch_limit() {
    let mut h = harness();
    h.config.coalesce_batch_limit = 2;
    for i in 1..=4 {
        h.enqueue_visitor(&format!("m{}", i), i as i64, "part").await;
    }

    let head = message("m1", 1, SenderType::Visitor, "part").meta();
    let outcome = coalesce_visitor_burst(h.db.as_ref(), &h.queue, &h.config, &head)
        .await
        .unwrap();
    assert_eq!(outcome.coalesced.len(), 2);
    assert_eq!(outcome.effective.id, MessageId::new("m2"));
}

// ===========================================================================
// Drain scenarios
// ===========================================================================

// One visitor message, one reply, cursor advanced.
#[tokio::test]
async fn simple_reply_drains_to_success() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_text("Hi! How can I help you today?");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.remaining, 0);
    assert!(summary.continuation.is_none());

    assert_eq!(h.cursor(), Some(Cursor::new("m1", ts(1))));
    let replies = h.ai_messages();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body_markdown, "Hi! How can I help you today?");
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());

    let completions = h.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].audience, Audience::All);
    assert!(matches!(
        completions[0].kind,
        EventKind::WorkflowCompleted {
            status: WorkflowStatus::Success,
            ..
        }
    ));

    // Seen exactly once per drain.
    let seen = h
        .emitter
        .filtered(|k| matches!(k, EventKind::ConversationSeen));
    assert_eq!(seen.len(), 1);
    assert_eq!(h.db.seen_count(&conv_id()), 1);
}

// A visitor burst becomes one pipeline run anchored on the last message.
#[tokio::test]
async fn visitor_burst_coalesces_into_one_run() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hi").await;
    h.enqueue_visitor("m2", 2, "Can you help?").await;
    h.enqueue_visitor("m3", 3, "It's urgent").await;
    h.model.push_text("Of course — what's going on?");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(h.model.call_count(), 1);
    assert_eq!(h.cursor(), Some(Cursor::new("m3", ts(3))));
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());
    assert_eq!(h.ai_messages().len(), 1);

    let decisions = h
        .emitter
        .filtered(|k| matches!(k, EventKind::DecisionMade { .. }));
    assert_eq!(decisions.len(), 1);
    match &decisions[0].kind {
        EventKind::DecisionMade { reason, .. } => {
            assert!(reason.contains("batched 3 visitor messages"), "{}", reason);
        }
        _ => unreachable!(),
    }
}

// Non-visitor triggers never run the pipeline; they only advance context.
#[tokio::test]
async fn non_visitor_messages_are_dequeued_without_runs() {
    let h = harness();
    h.db
        .seed_message(message("m1", 1, SenderType::HumanAgent, "internal"));
    h.queue.push(&conv_id(), &MessageId::new("m1")).await.unwrap();
    h.enqueue_visitor("m2", 2, "real question").await;
    h.model.push_text("Answer");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(h.model.call_count(), 1);
    assert_eq!(summary.processed, 1); // only the visitor trigger counts
    assert_eq!(h.cursor(), Some(Cursor::new("m2", ts(2))));
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());
}

// The cursor never moves backwards; covered messages are discarded.
#[tokio::test]
async fn cursor_is_monotonic() {
    let h = harness();
    h.enqueue_visitor("m2", 5, "newer").await;
    h.model.push_text("Reply to newer");
    h.worker.run(&h.job("m2")).await.unwrap();
    let after_first = h.cursor();
    assert_eq!(after_first, Some(Cursor::new("m2", ts(5))));

    // An older message shows up late; it must not rewind anything.
    h.enqueue_visitor("m1", 1, "older straggler").await;
    h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(h.cursor(), after_first);
    assert_eq!(h.model.call_count(), 1);
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());
}

// At most one drain per conversation.
#[tokio::test]
async fn concurrent_drains_do_not_overlap() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_text("Hi!");

    // A competing holder owns the lock; this drain must do nothing.
    assert!(h.lock.acquire(&conv_id(), "other-job").await.unwrap());
    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(h.model.call_count(), 0);
    assert_eq!(h.queue.len(&conv_id()).await.unwrap(), 1);

    // Once released, the drain proceeds.
    h.lock.release(&conv_id(), "other-job").await.unwrap();
    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
}

// Paused conversation: no pipeline, queue preserved, dashboard skip.
#[tokio::test]
async fn paused_conversation_preserves_queue() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.pause.pause(&conv_id(), None).await.unwrap();

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.remaining, 1);
    assert!(summary.continuation.is_none());
    assert_eq!(h.model.call_count(), 0);
    assert_eq!(h.queue.len(&conv_id()).await.unwrap(), 1);
    assert_eq!(h.cursor(), None);

    let completions = h.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].audience, Audience::Dashboard);
    assert!(matches!(
        &completions[0].kind,
        EventKind::WorkflowCompleted {
            status: WorkflowStatus::Skipped,
            ..
        }
    ));

    // Resume: the next drain picks the message up.
    h.pause.resume(&conv_id()).await.unwrap();
    h.model.push_text("Back now!");
    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
}

// Three transient failures exhaust the retry budget and drop the trigger.
#[tokio::test]
async fn retry_exhaustion_drops_trigger_and_advances_cursor() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    for _ in 0..3 {
        h.model.push_transient_error("llm unavailable");
    }

    // First two drains preserve the head for retry.
    for attempt in 1..=2 {
        let summary = h.worker.run(&h.job("m1")).await.unwrap();
        assert_eq!(summary.processed, 0, "attempt {}", attempt);
        assert_eq!(h.queue.len(&conv_id()).await.unwrap(), 1);
        assert!(summary.continuation.is_some());
        assert_eq!(h.cursor(), None);
    }

    // Third failure hits the threshold: drop and advance.
    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());
    assert_eq!(h.cursor(), Some(Cursor::new("m1", ts(1))));
    assert_eq!(h.model.call_count(), 3);
    assert!(h.ai_messages().is_empty());

    let completions = h.completions();
    assert_eq!(completions.len(), 3);
    assert!(completions
        .iter()
        .all(|c| c.audience == Audience::Dashboard));
}

// A fatal error drops the trigger immediately, without retries.
#[tokio::test]
async fn fatal_errors_drop_immediately() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_fatal_error("model rejected the request");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert!(h.queue.is_empty(&conv_id()).await.unwrap());
    assert_eq!(h.cursor(), Some(Cursor::new("m1", ts(1))));
    assert_eq!(h.model.call_count(), 1);
}

// A new visitor message supersedes the in-flight run; the replacement
// processes the whole burst with the original anchor.
#[tokio::test]
async fn supersede_during_generation_cancels_and_replaces() {
    let h = Arc::new(harness());
    h.enqueue_visitor("m1", 1, "First question").await;
    h.model.push_delayed_response(
        GenerateResponse::text_only("Stale reply"),
        Duration::from_millis(80),
    );
    h.model.push_text("Fresh reply covering both messages");

    let worker_h = h.clone();
    let drain = tokio::spawn(async move { worker_h.worker.run(&worker_h.job("m1")).await });

    // Let the first run reach generation, then supersede it.
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.enqueue_visitor("m2", 2, "Actually, here's more detail").await;
    let replacement = h
        .workflows
        .trigger_deduplicated(&conv_id(), Direction::Inbound, &MessageId::new("m2"), ts(2))
        .await
        .unwrap();
    assert!(replacement.is_replacement);

    // The replacement record keeps the first trigger as anchor.
    let state = h
        .workflows
        .get(&conv_id(), Direction::Inbound)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.anchor_message_id, MessageId::new("m1"));

    let summary = drain.await.unwrap().unwrap();
    assert_eq!(summary.processed, 2);

    // Exactly one visible reply, produced by the replacement run.
    let replies = h.ai_messages();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body_markdown, "Fresh reply covering both messages");
    assert_eq!(h.cursor(), Some(Cursor::new("m2", ts(2))));

    // Cancelled completion (dashboard) followed by success (all).
    let completions = h.completions();
    assert_eq!(completions.len(), 2);
    assert!(matches!(
        &completions[0].kind,
        EventKind::WorkflowCompleted {
            status: WorkflowStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(completions[0].audience, Audience::Dashboard);
    assert!(matches!(
        &completions[1].kind,
        EventKind::WorkflowCompleted {
            status: WorkflowStatus::Success,
            ..
        }
    ));
    assert_eq!(completions[1].audience, Audience::All);
}

// Hydration: an empty queue is refilled from the DB cursor.
#[tokio::test]
async fn empty_queue_hydrates_from_cursor() {
    let h = harness();
    h.db
        .seed_message(message("m1", 1, SenderType::Visitor, "Hello?"));
    h.model.push_text("Hi!");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(h.cursor(), Some(Cursor::new("m1", ts(1))));
    assert_eq!(h.ai_messages().len(), 1);
}

// Human-assigned conversations skip without a reply; the trigger is consumed.
#[tokio::test]
async fn assigned_conversation_skips_silently() {
    let h = harness();
    let mut c = conversation();
    c.assigned_user_ids.push(UserId::new("u1"));
    h.db.seed_conversation(c);
    h.enqueue_visitor("m1", 1, "Hello").await;

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(h.model.call_count(), 0);
    assert!(h.ai_messages().is_empty());
    assert_eq!(h.cursor(), Some(Cursor::new("m1", ts(1))));

    let decisions = h
        .emitter
        .filtered(|k| matches!(k, EventKind::DecisionMade { .. }));
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].audience, Audience::Dashboard);
}

// Low classifier confidence turns the reply into an auto-escalation.
#[tokio::test]
async fn low_confidence_reply_escalates_instead_of_sending() {
    let classifier = Arc::new(ScriptedModel::new());
    classifier.push_text("REPLY 0.3");
    let h = harness_with_classifier(Some(classifier));
    h.enqueue_visitor("m1", 1, "Something ambiguous").await;
    h.model.push_text("A shaky answer");

    let summary = h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(summary.processed, 1);

    let messages = h.ai_messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].body_markdown.contains("human teammate"));

    let completions = h.completions();
    assert_eq!(completions.len(), 1);
    match &completions[0].kind {
        EventKind::WorkflowCompleted { status, action, .. } => {
            assert_eq!(*status, WorkflowStatus::Success);
            assert_eq!(action.as_deref(), Some("escalated"));
        }
        _ => unreachable!(),
    }
}

// Event ordering: decision before generation progress before completion.
#[tokio::test]
async fn event_ordering_matches_the_contract() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_text("Hi!");
    h.worker.run(&h.job("m1")).await.unwrap();

    let events = h.emitter.events();
    let position = |pred: &dyn Fn(&EventKind) -> bool| {
        events
            .iter()
            .position(|e| pred(&e.kind))
            .expect("event present")
    };

    let seen = position(&|k| matches!(k, EventKind::ConversationSeen));
    let started = position(&|k| matches!(k, EventKind::WorkflowStarted { .. }));
    let decision = position(&|k| matches!(k, EventKind::DecisionMade { .. }));
    let generation = position(&|k| matches!(k, EventKind::GenerationProgress { .. }));
    let completed = position(&|k| matches!(k, EventKind::WorkflowCompleted { .. }));

    assert!(seen < started);
    assert!(started < decision);
    assert!(decision < generation);
    assert!(generation < completed);

    // The typing indicator was started and stopped exactly once each.
    let typing = typing_events(&events);
    assert_eq!(typing.first(), Some(&true));
    assert_eq!(typing.iter().filter(|t| !**t).count(), 1);
    assert_eq!(typing.last(), Some(&false));
}

// Tool-driven replies emit toolProgress to everyone.
#[tokio::test]
async fn tool_calls_emit_progress_for_all_audiences() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "What's your refund policy?").await;
    h.model.push_response(GenerateResponse {
        text: None,
        tool_calls: vec![ToolInvocation {
            id: "tc-1".into(),
            name: "send_visitor_message".into(),
            arguments: serde_json::json!({"message": "Refunds take 5 business days."}),
        }],
        usage: Default::default(),
    });

    h.worker.run(&h.job("m1")).await.unwrap();

    let progress = h
        .emitter
        .filtered(|k| matches!(k, EventKind::ToolProgress { .. }));
    assert_eq!(progress.len(), 2); // started + finished
    assert!(progress.iter().all(|e| e.audience == Audience::All));
    assert_eq!(h.ai_messages().len(), 1);
}

// Duplicate model output (tool call + same trailing text) stores one message.
#[tokio::test]
async fn tool_send_and_trailing_text_deduplicate() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hi").await;
    h.model.push_response(GenerateResponse {
        text: Some("Contact details confirmed".into()),
        tool_calls: vec![ToolInvocation {
            id: "tc-1".into(),
            name: "send_visitor_message".into(),
            arguments: serde_json::json!({"message": "  Contact   details   CONFIRMED "}),
        }],
        usage: Default::default(),
    });

    h.worker.run(&h.job("m1")).await.unwrap();
    assert_eq!(h.ai_messages().len(), 1);
}

// Usage from generation accumulates onto the agent.
#[tokio::test]
async fn agent_usage_accumulates() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_response(GenerateResponse {
        text: Some("Hi!".into()),
        tool_calls: Vec::new(),
        usage: TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 30,
            total_tokens: 150,
        },
    });

    h.worker.run(&h.job("m1")).await.unwrap();
    let usage = h.db.agent_usage(&agent_id());
    assert_eq!(usage.prompt_tokens, 120);
    assert_eq!(usage.total_tokens, 150);
}

// Workflow state is cleared after a completed run.
#[tokio::test]
async fn workflow_state_cleared_on_completion() {
    let h = harness();
    h.enqueue_visitor("m1", 1, "Hello").await;
    h.model.push_text("Hi!");
    h.worker.run(&h.job("m1")).await.unwrap();

    assert!(h
        .workflows
        .get(&conv_id(), Direction::Inbound)
        .await
        .unwrap()
        .is_none());
}

// ===========================================================================
// Wired engine (producer → dispatcher → drain)
// ===========================================================================

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_processes_triggers_end_to_end() {
    let db = Arc::new(MemoryDatabase::new());
    db.seed_conversation(conversation());
    db.seed_agent(support_agent());
    db.seed_message(message("m1", 1, SenderType::Visitor, "Hello"));

    let model = Arc::new(ScriptedModel::new());
    model.push_text("Hi! How can I help?");
    let emitter = Arc::new(RecordingEmitter::new());
    let config = EngineConfig {
        visitor_debounce: Duration::from_millis(1),
        ..EngineConfig::default()
    };

    let engine = Engine::start(
        db.clone(),
        Arc::new(MemoryStore::new()),
        model.clone(),
        None,
        emitter.clone(),
        create_default_registry(),
        config,
    );

    let trigger = Trigger {
        conversation_id: conv_id(),
        agent_id: agent_id(),
        message_id: MessageId::new("m1"),
        message_created_at: ts(1),
        sender_type: SenderType::Visitor,
    };
    engine.producer.on_new_message(&trigger).await.unwrap();
    // A redelivered trigger is harmless: it either collapses onto the
    // pending job or re-drains into a cursor-covered no-op.
    engine.producer.on_new_message(&trigger).await.unwrap();

    let db_probe = db.clone();
    wait_until(
        move || {
            db_probe
                .conversation_messages(&conv_id())
                .iter()
                .any(|m| m.sender_type == SenderType::AiAgent)
        },
        "the engine to reply",
    )
    .await;

    let replies: Vec<Message> = db
        .conversation_messages(&conv_id())
        .into_iter()
        .filter(|m| m.sender_type == SenderType::AiAgent)
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(model.call_count(), 1);

    engine.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_pause_and_resume_round_trip() {
    let db = Arc::new(MemoryDatabase::new());
    db.seed_conversation(conversation());
    db.seed_agent(support_agent());
    db.seed_message(message("m1", 1, SenderType::Visitor, "Hello"));

    let model = Arc::new(ScriptedModel::new());
    model.push_text("Hi!");
    let emitter = Arc::new(RecordingEmitter::new());
    let config = EngineConfig {
        visitor_debounce: Duration::from_millis(1),
        ..EngineConfig::default()
    };

    let engine = Engine::start(
        db.clone(),
        Arc::new(MemoryStore::new()),
        model.clone(),
        None,
        emitter.clone(),
        create_default_registry(),
        config,
    );

    engine.producer.pause_ai(&conv_id(), None).await.unwrap();
    let trigger = Trigger {
        conversation_id: conv_id(),
        agent_id: agent_id(),
        message_id: MessageId::new("m1"),
        message_created_at: ts(1),
        sender_type: SenderType::Visitor,
    };
    engine.producer.on_new_message(&trigger).await.unwrap();

    // Give the drain a moment: it must skip while paused.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(model.call_count(), 0);

    engine.producer.resume_ai(&conv_id()).await.unwrap();
    let wake = Trigger {
        message_id: MessageId::new("m1"),
        ..trigger.clone()
    };
    engine.producer.on_new_message(&wake).await.unwrap();

    let model_probe = model.clone();
    wait_until(move || model_probe.call_count() > 0, "the resumed drain").await;

    engine.shutdown(Duration::from_millis(200)).await;
}
