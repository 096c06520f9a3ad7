//! Tool trait and registry

use crate::context::RunContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use supportflow_core::{AgentMetadata, AiAgent};
use supportflow_llm::ToolDefinition;

#[derive(Clone, Debug)]
pub enum ToolResult {
    Json(Value),
    Error(String),
}

impl ToolResult {
    pub fn json(value: Value) -> Self {
        Self::Json(value)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Error(_) => None,
        }
    }
}

/// The Tool trait. Implement this to give the agent a new capability.
///
/// Tools receive the run context explicitly; nothing is closed over. A tool
/// with a behavior gate overrides `permitted`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "send_visitor_message").
    fn name(&self) -> &str;

    /// Description sent to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// Whether this agent's behavior settings allow the tool.
    fn permitted(&self, _agent: &AiAgent) -> bool {
        true
    }

    /// Sanitized human-readable progress label, safe for the widget.
    fn progress_message(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, ctx: &RunContext, args: Value) -> ToolResult;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, ctx: &RunContext, name: &str, args: Value) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) if tool.permitted(&ctx.agent) => tool.execute(ctx, args).await,
            Some(_) => ToolResult::error(format!("Tool '{}' is not permitted for this agent", name)),
            None => ToolResult::error(format!("Tool not found: {}", name)),
        }
    }

    /// Tool definitions offered to the model for this agent.
    ///
    /// Returns None when `disable_tools` is set or the effective set is
    /// empty. When `enabled_tools` is present, only those names are offered;
    /// unknown names are ignored.
    pub fn definitions_for_agent(&self, agent: &AiAgent) -> Option<Vec<ToolDefinition>> {
        let AgentMetadata {
            enabled_tools,
            disable_tools,
        } = &agent.metadata;
        if *disable_tools {
            return None;
        }

        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|tool| tool.permitted(agent))
            .filter(|tool| {
                enabled_tools
                    .as_ref()
                    .map_or(true, |names| names.iter().any(|n| n == tool.name()))
            })
            .map(|tool| tool.to_definition())
            .collect();

        if definitions.is_empty() {
            return None;
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Some(definitions)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}
