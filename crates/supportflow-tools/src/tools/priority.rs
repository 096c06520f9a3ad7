//! set_priority — behavior-gated conversation priority

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::{AiAgent, ConversationPriority};

pub struct SetPriority;

fn parse_level(level: &str) -> Option<ConversationPriority> {
    match level {
        "low" => Some(ConversationPriority::Low),
        "normal" => Some(ConversationPriority::Normal),
        "high" => Some(ConversationPriority::High),
        "urgent" => Some(ConversationPriority::Urgent),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Tool for SetPriority {
    fn name(&self) -> &str {
        "set_priority"
    }

    fn description(&self) -> &str {
        "Set the conversation priority: low, normal, high, or urgent."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "level": {
                    "type": "string",
                    "enum": ["low", "normal", "high", "urgent"]
                }
            },
            "required": ["level"]
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.can_set_priority
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let level = args.get("level").and_then(|v| v.as_str()).unwrap_or("");
        let priority = match parse_level(level) {
            Some(p) => p,
            None => {
                return ToolResult::error(format!(
                    "Invalid priority level '{}': expected low, normal, high, or urgent",
                    level
                ))
            }
        };

        match ctx
            .db
            .update_conversation_priority(&ctx.conversation.id, priority)
            .await
        {
            Ok(()) => ToolResult::json(json!({ "level": level })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
