//! resolve_conversation — behavior-gated resolution

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::{AiAgent, ConversationStatus};
use tracing::info;

pub struct ResolveConversation;

#[async_trait::async_trait]
impl Tool for ResolveConversation {
    fn name(&self) -> &str {
        "resolve_conversation"
    }

    fn description(&self) -> &str {
        "Mark this conversation as resolved. Only use once the visitor's \
         request is fully handled."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.can_resolve
    }

    async fn execute(&self, ctx: &RunContext, _args: Value) -> ToolResult {
        match ctx
            .db
            .update_conversation_status(&ctx.conversation.id, ConversationStatus::Resolved)
            .await
        {
            Ok(()) => {
                ctx.record_action("resolved").await;
                info!(conversation = %ctx.conversation.id, "conversation resolved");
                ToolResult::json(json!({ "resolved": true }))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
