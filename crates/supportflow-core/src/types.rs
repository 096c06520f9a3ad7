//! Domain types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declares a cheaply-cloneable string id wrapper.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                d: D,
            ) -> std::result::Result<Self, D::Error> {
                Ok(Self::new(String::deserialize(d)?))
            }
        }
    };
}

id_type!(
    /// Conversation identifier
    ConversationId
);
id_type!(
    /// Message identifier. A ULID, so lexicographic order is creation order
    MessageId
);
id_type!(OrganizationId);
id_type!(WebsiteId);
id_type!(VisitorId);
id_type!(UserId);
id_type!(
    /// AI agent configuration identifier
    AgentId
);
id_type!(
    /// One pipeline run; replaced on supersede
    RunId
);

/// Who authored a message
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Visitor,
    HumanAgent,
    AiAgent,
}

/// Message visibility on the conversation timeline
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Resolved,
    Spam,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// How the agent intends to respond to a trigger
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Reply,
    ProactiveReply,
    Silent,
}

/// Workflow direction for dedup keys. Inbound = visitor-triggered runs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// The AI processing cursor: the last message the agent consumed.
///
/// Totally ordered by `(created_at, id)`; ULID ids make the tie-break total.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

impl Cursor {
    pub fn new(message_id: impl Into<MessageId>, created_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            created_at,
        }
    }

    fn key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.message_id.as_str())
    }

    /// True if `meta` is at or before this cursor and must never be processed again.
    pub fn covers(&self, meta: &MessageMeta) -> bool {
        (meta.created_at, meta.id.as_str()) <= self.key()
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Metadata projection of a message: everything the drain loop needs
/// without loading bodies.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMeta {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub sender_type: SenderType,
    pub visibility: Visibility,
}

impl MessageMeta {
    /// Only public visitor messages trigger pipeline runs; everything else
    /// advances context.
    pub fn is_triggerable(&self) -> bool {
        self.sender_type == SenderType::Visitor && self.visibility == Visibility::Public
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.id.clone(), self.created_at)
    }
}

/// A full timeline message. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub sender_type: SenderType,
    pub visibility: Visibility,
    pub body_markdown: String,
}

impl Message {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            sender_type: self.sender_type,
            visibility: self.visibility,
        }
    }
}

/// Payload for inserting a new message.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_type: SenderType,
    pub visibility: Visibility,
    pub body_markdown: String,
    /// Slot-based idempotency key: inserts with an already-seen key return
    /// the original message instead of creating a duplicate.
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub organization_id: OrganizationId,
    pub website_id: WebsiteId,
    pub visitor_id: Option<VisitorId>,
    pub status: ConversationStatus,
    pub title: Option<String>,
    pub priority: Option<ConversationPriority>,
    pub sentiment: Option<String>,
    pub ai_paused_until: Option<DateTime<Utc>>,
    pub ai_last_processed_message_id: Option<MessageId>,
    pub ai_last_processed_message_created_at: Option<DateTime<Utc>>,
    pub assigned_user_ids: Vec<UserId>,
}

impl Conversation {
    pub fn cursor(&self) -> Option<Cursor> {
        match (
            &self.ai_last_processed_message_id,
            self.ai_last_processed_message_created_at,
        ) {
            (Some(id), Some(at)) => Some(Cursor::new(id.clone(), at)),
            _ => None,
        }
    }

    pub fn is_ai_paused(&self, now: DateTime<Utc>) -> bool {
        self.ai_paused_until.is_some_and(|until| until > now)
    }

    pub fn has_human_assignee(&self) -> bool {
        !self.assigned_user_ids.is_empty()
    }
}

/// Which final-turn actions the agent is allowed to take.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BehaviorSettings {
    pub can_resolve: bool,
    pub can_mark_spam: bool,
    pub can_set_priority: bool,
    pub can_escalate: bool,
    pub auto_generate_title: bool,
    pub auto_analyze_sentiment: bool,
}

/// Tool enablement carried on the agent record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentMetadata {
    /// When set, only these tool names are offered to the model.
    pub enabled_tools: Option<Vec<String>>,
    /// Hard off-switch: the model gets no tools at all.
    pub disable_tools: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiAgent {
    pub id: AgentId,
    pub model: String,
    pub base_prompt: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub is_active: bool,
    pub metadata: AgentMetadata,
    pub behavior: BehaviorSettings,
}

/// Visitor profile with contact fields, all optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Visitor {
    pub id: Option<VisitorId>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub timezone: Option<String>,
    pub browser: Option<String>,
    pub device: Option<String>,
}

/// Knowledge-base search hit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub title: String,
    pub content: String,
    pub confidence: f32,
}

/// Token accounting for one model call, accumulated onto the agent.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Dedup registry record for one `(conversation, direction)` workflow.
///
/// Replaced on supersede; `anchor_*` fields always describe the first trigger
/// in the supersede chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    pub anchor_message_id: MessageId,
    pub anchor_created_at: DateTime<Utc>,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A drain job handed to the worker pool.
#[derive(Clone, Debug)]
pub struct DrainJob {
    pub job_id: String,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub trigger_message_id: Option<MessageId>,
}

impl DrainJob {
    /// Deterministic job id so concurrent enqueues for the same trigger collapse.
    pub fn for_trigger(
        conversation_id: ConversationId,
        agent_id: AgentId,
        message_id: MessageId,
    ) -> Self {
        let job_id = format!("drain:{}:{}", conversation_id, message_id);
        Self {
            job_id,
            conversation_id,
            agent_id,
            trigger_message_id: Some(message_id),
        }
    }

    /// Continuation wake job keyed by the next queue head.
    pub fn for_wake(
        conversation_id: ConversationId,
        agent_id: AgentId,
        head_id: MessageId,
    ) -> Self {
        let job_id = format!("wake:{}:{}", conversation_id, head_id);
        Self {
            job_id,
            conversation_id,
            agent_id,
            trigger_message_id: Some(head_id),
        }
    }
}
