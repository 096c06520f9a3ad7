//! Agent tools — the actions the model may take during a reply
//!
//! Each tool is a self-contained file in src/tools/. Tools receive an
//! explicit `RunContext` (conversation snapshot, DB handle, send ledger,
//! typing control) instead of capturing request state.
//!
//! To add a tool: create the file, implement the Tool trait, register it in
//! `create_default_registry`.

pub mod context;
pub mod registry;
pub mod tools;

pub use context::{normalize_text, slot_key, RunContext, SendLedger, SlotReservation};
pub use registry::{Tool, ToolRegistry, ToolResult};
pub use tools::send_message::SendResult;

/// Create the default tool registry with every builtin tool. Behavior gating
/// and the agent's tool filter are applied at lookup time, not here.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(tools::send_message::SendVisitorMessage);
    registry.register(tools::search_kb::SearchKnowledgeBase);
    registry.register(tools::escalate::EscalateToHuman);
    registry.register(tools::title::SetConversationTitle);
    registry.register(tools::priority::SetPriority);
    registry.register(tools::sentiment::UpdateSentiment);
    registry.register(tools::resolve::ResolveConversation);
    registry.register(tools::mark_spam::MarkSpam);

    registry
}
