//! Realtime event protocol — typed events published to widget and dashboard
//!
//! Every event carries routing fields plus an audience. Audience policy:
//!
//!   decisionMade        → all when the agent acts, else dashboard
//!   workflowCompleted   → all on success, else dashboard
//!   workflowStarted     → dashboard
//!   toolProgress        → all (with a sanitized human-readable message)
//!   generationProgress  → dashboard
//!   typing              → all
//!   conversationSeen    → all
//!
//! Delivery is fire-and-forget best-effort: failures are logged by the sink,
//! never surfaced to the pipeline.

use crate::types::{
    ConversationId, OrganizationId, ResponseMode, RunId, UserId, VisitorId, WebsiteId,
};
use serde::Serialize;

/// The set of external subscribers an event reaches.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    All,
    Dashboard,
    Widget,
}

/// Routing fields present on every event payload.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventRouting {
    pub website_id: WebsiteId,
    pub organization_id: OrganizationId,
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<VisitorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl EventRouting {
    pub fn from_conversation(conversation: &crate::types::Conversation) -> Self {
        Self {
            website_id: conversation.website_id.clone(),
            organization_id: conversation.organization_id.clone(),
            conversation_id: conversation.id.clone(),
            visitor_id: conversation.visitor_id.clone(),
            user_id: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPhase {
    Thinking,
    Generating,
    Finalizing,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    Started,
    Finished,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Success,
    Error,
    Cancelled,
    Skipped,
}

/// Event bodies, discriminated by `kind` on the wire.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    WorkflowStarted { run_id: RunId },

    #[serde(rename_all = "camelCase")]
    DecisionMade {
        should_act: bool,
        mode: ResponseMode,
        reason: String,
    },

    GenerationProgress { phase: GenerationPhase },

    #[serde(rename_all = "camelCase")]
    ToolProgress {
        tool: String,
        state: ToolCallState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Typing { is_typing: bool },

    #[serde(rename_all = "camelCase")]
    WorkflowCompleted {
        status: WorkflowStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    ConversationSeen,
}

/// A routed event ready for publication.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OutboundEvent {
    #[serde(flatten)]
    pub routing: EventRouting,
    pub audience: Audience,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl OutboundEvent {
    pub fn workflow_started(routing: EventRouting, run_id: RunId) -> Self {
        Self {
            routing,
            audience: Audience::Dashboard,
            kind: EventKind::WorkflowStarted { run_id },
        }
    }

    pub fn decision_made(
        routing: EventRouting,
        should_act: bool,
        mode: ResponseMode,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            routing,
            audience: if should_act {
                Audience::All
            } else {
                Audience::Dashboard
            },
            kind: EventKind::DecisionMade {
                should_act,
                mode,
                reason: reason.into(),
            },
        }
    }

    pub fn generation_progress(routing: EventRouting, phase: GenerationPhase) -> Self {
        Self {
            routing,
            audience: Audience::Dashboard,
            kind: EventKind::GenerationProgress { phase },
        }
    }

    pub fn tool_progress(
        routing: EventRouting,
        tool: impl Into<String>,
        state: ToolCallState,
        message: Option<String>,
    ) -> Self {
        Self {
            routing,
            audience: Audience::All,
            kind: EventKind::ToolProgress {
                tool: tool.into(),
                state,
                message,
            },
        }
    }

    pub fn typing(routing: EventRouting, is_typing: bool) -> Self {
        Self {
            routing,
            audience: Audience::All,
            kind: EventKind::Typing { is_typing },
        }
    }

    pub fn workflow_completed(
        routing: EventRouting,
        status: WorkflowStatus,
        action: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            routing,
            audience: if status == WorkflowStatus::Success {
                Audience::All
            } else {
                Audience::Dashboard
            },
            kind: EventKind::WorkflowCompleted {
                status,
                action,
                reason,
            },
        }
    }

    pub fn conversation_seen(routing: EventRouting) -> Self {
        Self {
            routing,
            audience: Audience::All,
            kind: EventKind::ConversationSeen,
        }
    }
}

/// Sink for outbound events. Implementations must not block the pipeline;
/// `emit` returns false when the event could not be accepted so callers that
/// care (the typing heartbeat) can retry.
pub trait RealtimeEmitter: Send + Sync {
    fn emit(&self, event: OutboundEvent) -> bool;
}

/// Control handle for the visitor-visible typing indicator. The heartbeat in
/// the engine implements this; tools receive it through the run context so
/// the first public send can stop the indicator.
#[async_trait::async_trait]
pub trait TypingControl: Send + Sync {
    /// Idempotent: a second start while running is a no-op.
    async fn start(&self);
    /// Guaranteed-stop: clears the ticker first, then publishes typing=false.
    async fn stop(&self);
}
