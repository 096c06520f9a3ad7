//! Language model interface for the reply pipeline
//!
//! Generation is a single atomic call returning text plus any tool calls;
//! multi-turn tool loops are not built here.

pub mod anthropic;
pub mod provider;
pub mod scripted;
pub mod types;

pub use anthropic::AnthropicModel;
pub use provider::{LanguageModel, LlmError, LlmResult};
pub use scripted::ScriptedModel;
pub use types::{
    ChatMessage, ChatRole, GenerateRequest, GenerateResponse, ToolDefinition, ToolInvocation,
};
