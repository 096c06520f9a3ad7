//! set_conversation_title — behavior-gated title generation

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::AiAgent;

const MAX_TITLE_LEN: usize = 120;

pub struct SetConversationTitle;

#[async_trait::async_trait]
impl Tool for SetConversationTitle {
    fn name(&self) -> &str {
        "set_conversation_title"
    }

    fn description(&self) -> &str {
        "Set a short descriptive title for this conversation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short conversation title"
                }
            },
            "required": ["title"]
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.auto_generate_title
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let title = match args.get("title").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => t.trim(),
            _ => return ToolResult::error("Missing required parameter: title"),
        };
        let title: String = title.chars().take(MAX_TITLE_LEN).collect();

        match ctx
            .db
            .update_conversation_title(&ctx.conversation.id, &title)
            .await
        {
            Ok(()) => ToolResult::json(json!({ "title": title })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
