//! send_visitor_message — the multi-turn reply primitive
//!
//! Idempotency layers, in order:
//!   1. stale-trigger suppression: a newer public visitor message exists
//!   2. per-run duplicate suppression: normalized text already sent this run
//!   3. slot-based idempotency key: retries of the same slot collapse in the
//!      DB even when the wording changed
//!
//! The first public send stops the typing indicator; later sends are emitted
//! directly unless the restart flag is set.

use crate::context::{normalize_text, slot_key, RunContext, SlotReservation};
use crate::registry::{Tool, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use supportflow_core::{MessageId, NewMessage, SenderType, Visibility};
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendResult {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub created: bool,
    pub paused: bool,
    pub duplicate_suppressed: bool,
    pub stale_trigger_suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SendResult {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    fn into_result(self) -> ToolResult {
        match serde_json::to_value(&self) {
            Ok(value) => ToolResult::json(value),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

pub struct SendVisitorMessage;

#[async_trait::async_trait]
impl Tool for SendVisitorMessage {
    fn name(&self) -> &str {
        "send_visitor_message"
    }

    fn description(&self) -> &str {
        "Send a visible reply to the visitor. Call once per distinct message; \
         duplicate or out-of-date sends are suppressed automatically."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Markdown body of the reply"
                }
            },
            "required": ["message"]
        })
    }

    fn progress_message(&self) -> Option<&str> {
        Some("Replying to the visitor")
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let message = match args.get("message").and_then(|v| v.as_str()) {
            Some(m) if !m.trim().is_empty() => m.trim().to_string(),
            Some(_) => return ToolResult::error("message must not be empty"),
            None => return ToolResult::error("Missing required parameter: message"),
        };

        if !ctx.allow_public_messages {
            return SendResult::skipped("public messages not allowed for this trigger")
                .into_result();
        }

        if ctx.sends_paused() {
            return SendResult {
                paused: true,
                ..SendResult::skipped("sends paused for this run")
            }
            .into_result();
        }

        // Stale-trigger suppression: if the visitor already sent something
        // newer, this reply belongs to a superseded run.
        let latest = match ctx
            .db
            .latest_public_visitor_message_id(&ctx.conversation.id)
            .await
        {
            Ok(latest) => latest,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        if let Some(latest) = latest {
            if latest > ctx.trigger_message_id {
                debug!(
                    conversation = %ctx.conversation.id,
                    trigger = %ctx.trigger_message_id,
                    latest = %latest,
                    "suppressing send for stale trigger"
                );
                return SendResult {
                    stale_trigger_suppressed: true,
                    ..Default::default()
                }
                .into_result();
            }
        }

        let normalized = normalize_text(&message);
        let slot = match ctx.reserve_slot(&normalized).await {
            SlotReservation::Slot(slot) => slot,
            SlotReservation::Duplicate => {
                return SendResult {
                    duplicate_suppressed: true,
                    ..Default::default()
                }
                .into_result();
            }
        };

        let key = slot_key(&ctx.conversation.id, &ctx.trigger_message_id, slot);
        let inserted = match ctx
            .db
            .insert_message(NewMessage {
                conversation_id: ctx.conversation.id.clone(),
                sender_type: SenderType::AiAgent,
                visibility: Visibility::Public,
                body_markdown: message,
                idempotency_key: Some(key),
            })
            .await
        {
            Ok(inserted) => inserted,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let send_count = ctx.note_public_send().await;
        if send_count == 1 {
            ctx.typing.stop().await;
        }
        if ctx.restart_typing_between_sends {
            ctx.typing.start().await;
        }

        // A human may have paused the conversation mid-run; if so, drop any
        // further sends.
        let paused = match ctx.db.conversation_by_id(&ctx.conversation.id).await {
            Ok(Some(conversation)) => conversation.is_ai_paused(chrono::Utc::now()),
            _ => false,
        };
        if paused {
            ctx.pause_sends();
        }

        SendResult {
            sent: true,
            message_id: Some(inserted.message.id),
            created: inserted.created,
            paused,
            ..Default::default()
        }
        .into_result()
    }
}
