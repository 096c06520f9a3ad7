//! mark_spam — behavior-gated spam flagging

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::{AiAgent, ConversationStatus};
use tracing::info;

pub struct MarkSpam;

#[async_trait::async_trait]
impl Tool for MarkSpam {
    fn name(&self) -> &str {
        "mark_spam"
    }

    fn description(&self) -> &str {
        "Flag this conversation as spam. The agent stops replying to spam \
         conversations."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.can_mark_spam
    }

    async fn execute(&self, ctx: &RunContext, _args: Value) -> ToolResult {
        match ctx
            .db
            .update_conversation_status(&ctx.conversation.id, ConversationStatus::Spam)
            .await
        {
            Ok(()) => {
                ctx.record_action("marked_spam").await;
                ctx.pause_sends();
                info!(conversation = %ctx.conversation.id, "conversation marked as spam");
                ToolResult::json(json!({ "spam": true }))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
