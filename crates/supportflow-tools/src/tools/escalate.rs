//! escalate_to_human — hand the conversation to a human teammate
//!
//! Creates a public participant-requested timeline message and records a
//! human-audience outcome for the run.

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::{AiAgent, NewMessage, SenderType, Visibility};
use tracing::info;

pub struct EscalateToHuman;

#[async_trait::async_trait]
impl Tool for EscalateToHuman {
    fn name(&self) -> &str {
        "escalate_to_human"
    }

    fn description(&self) -> &str {
        "Request a human teammate for this conversation. Use when the visitor \
         asks for a person or the request is beyond what you can resolve."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why a human is needed"
                }
            },
            "required": ["reason"]
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.can_escalate
    }

    fn progress_message(&self) -> Option<&str> {
        Some("Requesting a human teammate")
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("escalation requested")
            .to_string();

        // One escalation per trigger, regardless of retries.
        let key = format!(
            "escalate:{}:{}",
            ctx.conversation.id, ctx.trigger_message_id
        );
        let inserted = match ctx
            .db
            .insert_message(NewMessage {
                conversation_id: ctx.conversation.id.clone(),
                sender_type: SenderType::AiAgent,
                visibility: Visibility::Public,
                body_markdown: "A human teammate has been requested for this conversation."
                    .to_string(),
                idempotency_key: Some(key),
            })
            .await
        {
            Ok(inserted) => inserted,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        ctx.record_action("escalated").await;
        info!(
            conversation = %ctx.conversation.id,
            %reason,
            "conversation escalated to a human"
        );

        ToolResult::json(json!({
            "escalated": true,
            "reason": reason,
            "eventMessageId": inserted.message.id,
        }))
    }
}
