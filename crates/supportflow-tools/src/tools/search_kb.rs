//! search_knowledge_base — context retrieval for the model

use crate::context::RunContext;
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};

const MAX_RESULTS: usize = 5;

pub struct SearchKnowledgeBase;

#[async_trait::async_trait]
impl Tool for SearchKnowledgeBase {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Search the organization's knowledge base. Returns matching snippets \
         with a confidence score."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look up"
                }
            },
            "required": ["query"]
        })
    }

    fn progress_message(&self) -> Option<&str> {
        Some("Searching the knowledge base")
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult {
        let query = match args.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.trim(),
            _ => return ToolResult::error("Missing required parameter: query"),
        };

        match ctx
            .db
            .search_knowledge(&ctx.conversation.organization_id, query, MAX_RESULTS)
            .await
        {
            Ok(snippets) => {
                let count = snippets.len();
                ToolResult::json(json!({
                    "results": snippets,
                    "count": count,
                }))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
