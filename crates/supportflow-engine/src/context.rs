//! Context builder — conversation history and visitor context for the model

use supportflow_core::{Conversation, Database, Result, SenderType, Visitor};
use supportflow_llm::ChatMessage;

pub struct BuiltContext {
    /// Chronological chat history, visitor as user, agents as assistant.
    pub messages: Vec<ChatMessage>,
    /// Markdown block describing the visitor; empty when nothing is known.
    pub visitor_block: String,
}

pub struct ContextBuilder {
    max_messages: usize,
}

impl ContextBuilder {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    pub async fn build(
        &self,
        db: &dyn Database,
        conversation: &Conversation,
        visitor: Option<&Visitor>,
    ) -> Result<BuiltContext> {
        // Newest-first from the DB, reversed into chronological order.
        let recent = db
            .recent_public_messages(&conversation.id, self.max_messages)
            .await?;

        let messages = recent
            .into_iter()
            .rev()
            .filter(|m| !m.body_markdown.trim().is_empty())
            .map(|m| match m.sender_type {
                SenderType::Visitor => ChatMessage::user(m.body_markdown),
                SenderType::HumanAgent | SenderType::AiAgent => {
                    ChatMessage::assistant(m.body_markdown)
                }
            })
            .collect();

        Ok(BuiltContext {
            messages,
            visitor_block: visitor.map(visitor_context_block).unwrap_or_default(),
        })
    }
}

/// Assemble the visitor context markdown block. Lines without data are
/// omitted; no data at all yields an empty string.
pub fn visitor_context_block(visitor: &Visitor) -> String {
    let mut lines = Vec::new();

    let mut push = |label: &str, value: &Option<String>| {
        if let Some(v) = value {
            if !v.trim().is_empty() {
                lines.push(format!("- {}: {}", label, v.trim()));
            }
        }
    };

    push("Name", &visitor.name);
    push("Email", &visitor.email);

    let location = match (&visitor.city, &visitor.country) {
        (Some(city), Some(country)) => Some(format!("{}, {}", city, country)),
        (Some(city), None) => Some(city.clone()),
        (None, Some(country)) => Some(country.clone()),
        (None, None) => None,
    };
    push("Location", &location);

    push("Language", &visitor.language);
    push("Timezone", &visitor.timezone);
    push("Browser", &visitor.browser);
    push("Device", &visitor.device);

    if lines.is_empty() {
        return String::new();
    }
    format!("## Visitor context\n{}", lines.join("\n"))
}
