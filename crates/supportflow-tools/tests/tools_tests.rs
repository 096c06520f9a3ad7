//! Tests for supportflow-tools: send idempotency, permission filter, gating

use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use supportflow_core::*;
use supportflow_tools::*;

fn ts(seconds: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

struct NullEmitter;

impl RealtimeEmitter for NullEmitter {
    fn emit(&self, _event: OutboundEvent) -> bool {
        true
    }
}

#[derive(Default)]
struct CountingTyping {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait::async_trait]
impl TypingControl for CountingTyping {
    async fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn conversation() -> Conversation {
    Conversation {
        id: ConversationId::new("c1"),
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

fn agent() -> AiAgent {
    AiAgent {
        id: AgentId::new("a1"),
        model: "claude-haiku-4-5".into(),
        base_prompt: "You are a support agent.".into(),
        temperature: None,
        max_output_tokens: None,
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

fn visitor_message(db: &MemoryDatabase, id: &str, seconds: i64, body: &str) {
    db.seed_message(Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new("c1"),
        created_at: ts(seconds),
        sender_type: SenderType::Visitor,
        visibility: Visibility::Public,
        body_markdown: body.to_string(),
    });
}

struct Fixture {
    db: Arc<MemoryDatabase>,
    typing: Arc<CountingTyping>,
    ctx: RunContext,
}

fn fixture() -> Fixture {
    fixture_for_trigger("m1")
}

fn fixture_for_trigger(trigger: &str) -> Fixture {
    let db = Arc::new(MemoryDatabase::new());
    db.seed_conversation(conversation());
    visitor_message(&db, trigger, 1, "Hello");

    let typing = Arc::new(CountingTyping::default());
    let ctx = RunContext::new(
        conversation(),
        agent(),
        RunId::new("run-1"),
        MessageId::new(trigger),
        ts(1),
        SenderType::Visitor,
        Visibility::Public,
        db.clone(),
        Arc::new(NullEmitter),
        typing.clone(),
    );
    Fixture { db, typing, ctx }
}

fn send_args(text: &str) -> serde_json::Value {
    serde_json::json!({ "message": text })
}

fn parse_send(result: &ToolResult) -> SendResult {
    let value = result.as_json().expect("send returned an error").clone();
    serde_json::from_value(value).expect("send result shape")
}

// ===========================================================================
// normalize / slot keys
// ===========================================================================

#[test]
fn normalization_collapses_whitespace_and_case() {
    assert_eq!(
        normalize_text("  Contact   Details\n confirmed  "),
        "contact details confirmed"
    );
    assert_eq!(normalize_text("a b"), normalize_text("A \t B"));
}

#[test]
fn slot_keys_bind_conversation_trigger_and_slot() {
    let key = slot_key(&ConversationId::new("c1"), &MessageId::new("m1"), 2);
    assert_eq!(key, "send:c1:m1:slot:2");
}

#[test]
fn ledger_assigns_monotonic_slots() {
    let mut ledger = SendLedger::default();
    assert_eq!(ledger.reserve("one"), SlotReservation::Slot(0));
    assert_eq!(ledger.reserve("two"), SlotReservation::Slot(1));
    assert_eq!(ledger.reserve("one"), SlotReservation::Duplicate);
    assert_eq!(ledger.reserve("three"), SlotReservation::Slot(2));
}

// ===========================================================================
// send_visitor_message
// ===========================================================================

#[tokio::test]
async fn simple_send_persists_one_public_message() {
    let f = fixture();
    let registry = create_default_registry();

    let result = registry
        .execute(&f.ctx, "send_visitor_message", send_args("Hi there!"))
        .await;
    let send = parse_send(&result);
    assert!(send.sent);
    assert!(send.created);
    assert!(!send.paused);

    let messages = f.db.conversation_messages(&ConversationId::new("c1"));
    let ai_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::AiAgent)
        .collect();
    assert_eq!(ai_messages.len(), 1);
    assert_eq!(ai_messages[0].body_markdown, "Hi there!");
}

#[tokio::test]
async fn equivalent_text_in_one_run_is_suppressed() {
    let f = fixture();
    let registry = create_default_registry();

    let first = registry
        .execute(
            &f.ctx,
            "send_visitor_message",
            send_args("Contact details confirmed"),
        )
        .await;
    assert!(parse_send(&first).sent);

    let second = registry
        .execute(
            &f.ctx,
            "send_visitor_message",
            send_args("  contact   details   confirmed  "),
        )
        .await;
    let send = parse_send(&second);
    assert!(!send.sent);
    assert!(send.duplicate_suppressed);

    let ai_count = f
        .db
        .conversation_messages(&ConversationId::new("c1"))
        .iter()
        .filter(|m| m.sender_type == SenderType::AiAgent)
        .count();
    assert_eq!(ai_count, 1);
}

#[tokio::test]
async fn same_slot_across_runs_collapses_despite_rewording() {
    // Two pipeline runs for the same trigger (a retry): slot 0 both times,
    // different wording. The slot key — not the text — binds identity.
    let first_run = fixture();
    let registry = create_default_registry();

    let first = registry
        .execute(&first_run.ctx, "send_visitor_message", send_args("Answer A"))
        .await;
    let first = parse_send(&first);
    assert!(first.created);

    let retry_ctx = RunContext::new(
        conversation(),
        agent(),
        RunId::new("run-2"),
        MessageId::new("m1"),
        ts(1),
        SenderType::Visitor,
        Visibility::Public,
        first_run.db.clone(),
        Arc::new(NullEmitter),
        Arc::new(CountingTyping::default()),
    );
    let retry = registry
        .execute(&retry_ctx, "send_visitor_message", send_args("Answer B"))
        .await;
    let retry = parse_send(&retry);
    assert!(retry.sent);
    assert!(!retry.created);
    assert_eq!(retry.message_id, first.message_id);

    let ai_count = first_run
        .db
        .conversation_messages(&ConversationId::new("c1"))
        .iter()
        .filter(|m| m.sender_type == SenderType::AiAgent)
        .count();
    assert_eq!(ai_count, 1);
}

#[tokio::test]
async fn stale_trigger_is_suppressed_without_side_effects() {
    let f = fixture();
    // A newer public visitor message arrived after the trigger.
    visitor_message(&f.db, "m2", 2, "Actually, one more thing");

    let registry = create_default_registry();
    let result = registry
        .execute(&f.ctx, "send_visitor_message", send_args("Old reply"))
        .await;
    let send = parse_send(&result);
    assert!(!send.sent);
    assert!(send.stale_trigger_suppressed);

    let ai_count = f
        .db
        .conversation_messages(&ConversationId::new("c1"))
        .iter()
        .filter(|m| m.sender_type == SenderType::AiAgent)
        .count();
    assert_eq!(ai_count, 0);
}

#[tokio::test]
async fn first_send_stops_typing_exactly_once() {
    let f = fixture();
    let registry = create_default_registry();

    registry
        .execute(&f.ctx, "send_visitor_message", send_args("First"))
        .await;
    registry
        .execute(&f.ctx, "send_visitor_message", send_args("Second"))
        .await;

    assert_eq!(f.typing.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.typing.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn restart_flag_restarts_typing_after_sends() {
    let f = fixture();
    let ctx = RunContext::new(
        conversation(),
        agent(),
        RunId::new("run-1"),
        MessageId::new("m1"),
        ts(1),
        SenderType::Visitor,
        Visibility::Public,
        f.db.clone(),
        Arc::new(NullEmitter),
        f.typing.clone(),
    )
    .with_restart_typing(true);

    let registry = create_default_registry();
    registry
        .execute(&ctx, "send_visitor_message", send_args("First"))
        .await;

    assert_eq!(f.typing.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.typing.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn paused_conversation_drops_subsequent_sends() {
    let f = fixture();
    let registry = create_default_registry();

    let first = registry
        .execute(&f.ctx, "send_visitor_message", send_args("First"))
        .await;
    assert!(parse_send(&first).sent);

    // A human pauses the conversation mid-run.
    f.db
        .update_ai_pause(
            &ConversationId::new("c1"),
            Some(Utc::now() + chrono::Duration::minutes(30)),
        )
        .await
        .unwrap();

    let second = registry
        .execute(&f.ctx, "send_visitor_message", send_args("Second"))
        .await;
    let second = parse_send(&second);
    assert!(second.sent);
    assert!(second.paused);

    let third = registry
        .execute(&f.ctx, "send_visitor_message", send_args("Third"))
        .await;
    let third = parse_send(&third);
    assert!(!third.sent);
    assert!(third.paused);
}

#[tokio::test]
async fn private_trigger_forbids_public_sends() {
    let f = fixture();
    let ctx = RunContext::new(
        conversation(),
        agent(),
        RunId::new("run-1"),
        MessageId::new("m1"),
        ts(1),
        SenderType::Visitor,
        Visibility::Private,
        f.db.clone(),
        Arc::new(NullEmitter),
        Arc::new(CountingTyping::default()),
    );

    let registry = create_default_registry();
    let result = registry
        .execute(&ctx, "send_visitor_message", send_args("Hello"))
        .await;
    let send = parse_send(&result);
    assert!(!send.sent);
    assert!(send.reason.is_some());
}

// ===========================================================================
// Permission filter
// ===========================================================================

#[test]
fn disable_tools_removes_everything() {
    let registry = create_default_registry();
    let mut disabled = agent();
    disabled.metadata.disable_tools = true;
    assert!(registry.definitions_for_agent(&disabled).is_none());
}

#[test]
fn enabled_tools_filters_and_ignores_unknown_names() {
    let registry = create_default_registry();
    let mut limited = agent();
    limited.metadata.enabled_tools = Some(vec![
        "send_visitor_message".into(),
        "does_not_exist".into(),
    ]);

    let definitions = registry.definitions_for_agent(&limited).unwrap();
    let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["send_visitor_message"]);
}

#[test]
fn empty_effective_set_disables_tools() {
    let registry = create_default_registry();
    let mut empty = agent();
    empty.metadata.enabled_tools = Some(vec!["does_not_exist".into()]);
    assert!(registry.definitions_for_agent(&empty).is_none());
}

#[test]
fn behavior_gates_exclude_tools_from_definitions() {
    let registry = create_default_registry();
    let mut muted = agent();
    muted.behavior.can_escalate = false;
    muted.behavior.can_set_priority = false;
    muted.behavior.auto_generate_title = false;
    muted.behavior.auto_analyze_sentiment = false;

    let definitions = registry.definitions_for_agent(&muted).unwrap();
    let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "resolve_conversation",
            "search_knowledge_base",
            "send_visitor_message"
        ]
    );
}

#[tokio::test]
async fn gated_tool_execution_is_rejected() {
    let mut f = fixture();
    f.ctx.agent.behavior.can_escalate = false;

    let registry = create_default_registry();
    let result = registry
        .execute(
            &f.ctx,
            "escalate_to_human",
            serde_json::json!({"reason": "visitor asked"}),
        )
        .await;
    assert!(result.is_error());
}

// ===========================================================================
// Other tools
// ===========================================================================

#[tokio::test]
async fn escalation_is_idempotent_per_trigger_and_records_action() {
    let f = fixture();
    let registry = create_default_registry();

    for _ in 0..2 {
        let result = registry
            .execute(
                &f.ctx,
                "escalate_to_human",
                serde_json::json!({"reason": "complex billing issue"}),
            )
            .await;
        assert!(!result.is_error());
    }

    let escalations = f
        .db
        .conversation_messages(&ConversationId::new("c1"))
        .iter()
        .filter(|m| m.body_markdown.contains("human teammate"))
        .count();
    assert_eq!(escalations, 1);
    assert_eq!(f.ctx.recorded_action().await.as_deref(), Some("escalated"));
}

#[tokio::test]
async fn title_priority_and_sentiment_write_through() {
    let f = fixture();
    let registry = create_default_registry();

    registry
        .execute(
            &f.ctx,
            "set_conversation_title",
            serde_json::json!({"title": "Billing question"}),
        )
        .await;
    registry
        .execute(&f.ctx, "set_priority", serde_json::json!({"level": "high"}))
        .await;
    registry
        .execute(
            &f.ctx,
            "update_sentiment",
            serde_json::json!({"label": "positive"}),
        )
        .await;

    let stored = f.db.conversation(&ConversationId::new("c1")).unwrap();
    assert_eq!(stored.title.as_deref(), Some("Billing question"));
    assert_eq!(stored.priority, Some(ConversationPriority::High));
    assert_eq!(stored.sentiment.as_deref(), Some("positive"));
}

#[tokio::test]
async fn invalid_priority_and_sentiment_are_rejected() {
    let f = fixture();
    let registry = create_default_registry();

    let bad_priority = registry
        .execute(&f.ctx, "set_priority", serde_json::json!({"level": "asap"}))
        .await;
    assert!(bad_priority.is_error());

    let bad_sentiment = registry
        .execute(
            &f.ctx,
            "update_sentiment",
            serde_json::json!({"label": "ecstatic"}),
        )
        .await;
    assert!(bad_sentiment.is_error());
}

#[tokio::test]
async fn resolution_updates_status_and_records_action() {
    let f = fixture();
    let registry = create_default_registry();

    let result = registry
        .execute(&f.ctx, "resolve_conversation", serde_json::json!({}))
        .await;
    assert!(!result.is_error());

    let stored = f.db.conversation(&ConversationId::new("c1")).unwrap();
    assert_eq!(stored.status, ConversationStatus::Resolved);
    assert_eq!(f.ctx.recorded_action().await.as_deref(), Some("resolved"));
}

#[tokio::test]
async fn spam_marking_is_gated_and_pauses_sends() {
    let f = fixture();
    let registry = create_default_registry();

    // The fixture agent may not mark spam.
    let denied = registry
        .execute(&f.ctx, "mark_spam", serde_json::json!({}))
        .await;
    assert!(denied.is_error());

    let mut f = fixture();
    f.ctx.agent.behavior.can_mark_spam = true;
    let allowed = registry
        .execute(&f.ctx, "mark_spam", serde_json::json!({}))
        .await;
    assert!(!allowed.is_error());

    let stored = f.db.conversation(&ConversationId::new("c1")).unwrap();
    assert_eq!(stored.status, ConversationStatus::Spam);
    assert!(f.ctx.sends_paused());
}

#[tokio::test]
async fn knowledge_search_returns_ranked_snippets() {
    let f = fixture();
    f.db.seed_knowledge(
        OrganizationId::new("org1"),
        KnowledgeSnippet {
            title: "Refund policy".into(),
            content: "Refunds are processed within 5 business days.".into(),
            confidence: 0.8,
        },
    );

    let registry = create_default_registry();
    let result = registry
        .execute(
            &f.ctx,
            "search_knowledge_base",
            serde_json::json!({"query": "refund"}),
        )
        .await;
    let value = result.as_json().unwrap();
    assert_eq!(value["count"], 1);
    assert_eq!(value["results"][0]["title"], "Refund policy");
}
