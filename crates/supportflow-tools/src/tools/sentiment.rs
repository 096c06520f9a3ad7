//! update_sentiment — behavior-gated sentiment label

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use supportflow_core::AiAgent;

const LABELS: &[&str] = &["positive", "neutral", "negative"];

pub struct UpdateSentiment;

#[async_trait::async_trait]
impl Tool for UpdateSentiment {
    fn name(&self) -> &str {
        "update_sentiment"
    }

    fn description(&self) -> &str {
        "Record the visitor's sentiment: positive, neutral, or negative."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "enum": LABELS
                }
            },
            "required": ["label"]
        })
    }

    fn permitted(&self, agent: &AiAgent) -> bool {
        agent.behavior.auto_analyze_sentiment
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let label = args.get("label").and_then(|v| v.as_str()).unwrap_or("");
        if !LABELS.contains(&label) {
            return ToolResult::error(format!(
                "Invalid sentiment label '{}': expected one of {}",
                label,
                LABELS.join(", ")
            ));
        }

        match ctx
            .db
            .update_conversation_sentiment(&ctx.conversation.id, label)
            .await
        {
            Ok(()) => ToolResult::json(json!({ "label": label })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
