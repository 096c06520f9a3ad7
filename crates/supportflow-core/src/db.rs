//! Database contract — the transactional store is an external collaborator;
//! only its read/write surface is specified here. `MemoryDatabase` backs
//! tests and local runs.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of an idempotent message insert.
#[derive(Clone, Debug)]
pub struct InsertedMessage {
    pub message: Message,
    /// False when the idempotency key matched an earlier insert.
    pub created: bool,
}

#[async_trait::async_trait]
pub trait Database: Send + Sync {
    async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    async fn agent_by_id(&self, id: &AgentId) -> Result<Option<AiAgent>>;

    async fn visitor_with_contact(&self, id: &VisitorId) -> Result<Option<Visitor>>;

    async fn message_meta(&self, id: &MessageId) -> Result<Option<MessageMeta>>;

    async fn message_meta_batch(&self, ids: &[MessageId]) -> Result<Vec<MessageMeta>>;

    /// Messages strictly after the cursor in `(created_at, id)` order,
    /// ascending, at most `limit`.
    async fn messages_after_cursor(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<MessageMeta>>;

    /// Public timeline messages, newest first, at most `limit`.
    async fn recent_public_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>>;

    async fn latest_public_visitor_message_id(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageId>>;

    async fn search_knowledge(
        &self,
        organization_id: &OrganizationId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeSnippet>>;

    async fn insert_message(&self, message: NewMessage) -> Result<InsertedMessage>;

    async fn mark_conversation_seen(
        &self,
        conversation_id: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_ai_cursor(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
    ) -> Result<()>;

    async fn update_ai_pause(
        &self,
        conversation_id: &ConversationId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn update_conversation_status(
        &self,
        conversation_id: &ConversationId,
        status: ConversationStatus,
    ) -> Result<()>;

    async fn update_conversation_title(
        &self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> Result<()>;

    async fn update_conversation_priority(
        &self,
        conversation_id: &ConversationId,
        priority: ConversationPriority,
    ) -> Result<()>;

    async fn update_conversation_sentiment(
        &self,
        conversation_id: &ConversationId,
        label: &str,
    ) -> Result<()>;

    async fn update_agent_usage(&self, agent_id: &AgentId, usage: &TokenUsage) -> Result<()>;
}

/// In-memory database keyed by DashMaps. Messages are kept sorted by
/// `(created_at, id)` per conversation.
#[derive(Default)]
pub struct MemoryDatabase {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
    agents: DashMap<AgentId, AiAgent>,
    visitors: DashMap<VisitorId, Visitor>,
    knowledge: DashMap<OrganizationId, Vec<KnowledgeSnippet>>,
    idempotency: DashMap<String, MessageId>,
    seen: DashMap<ConversationId, u64>,
    usage: DashMap<AgentId, TokenUsage>,
    next_id: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_conversation(&self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn seed_agent(&self, agent: AiAgent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn seed_visitor(&self, visitor: Visitor) {
        if let Some(id) = visitor.id.clone() {
            self.visitors.insert(id, visitor);
        }
    }

    pub fn seed_message(&self, message: Message) {
        let mut entry = self
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        entry.push(message);
        entry.sort_by(|a, b| {
            (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str()))
        });
    }

    pub fn seed_knowledge(&self, organization_id: OrganizationId, snippet: KnowledgeSnippet) {
        self.knowledge
            .entry(organization_id)
            .or_default()
            .push(snippet);
    }

    /// Times `mark_conversation_seen` ran for a conversation.
    pub fn seen_count(&self, conversation_id: &ConversationId) -> u64 {
        self.seen.get(conversation_id).map(|c| *c).unwrap_or(0)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.get(id).map(|c| c.clone())
    }

    pub fn conversation_messages(&self, id: &ConversationId) -> Vec<Message> {
        self.messages.get(id).map(|m| m.clone()).unwrap_or_default()
    }

    pub fn agent_usage(&self, id: &AgentId) -> TokenUsage {
        self.usage.get(id).map(|u| *u).unwrap_or_default()
    }

    fn generate_message_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        MessageId::new(format!("gen-{:010}", n))
    }

    fn with_conversation<T>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Conversation) -> T,
    ) -> Result<T> {
        match self.conversations.get_mut(id) {
            Some(mut entry) => Ok(f(&mut entry)),
            None => Err(Error::not_found(format!("conversation {}", id))),
        }
    }
}

#[async_trait::async_trait]
impl Database for MemoryDatabase {
    async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn agent_by_id(&self, id: &AgentId) -> Result<Option<AiAgent>> {
        Ok(self.agents.get(id).map(|a| a.clone()))
    }

    async fn visitor_with_contact(&self, id: &VisitorId) -> Result<Option<Visitor>> {
        Ok(self.visitors.get(id).map(|v| v.clone()))
    }

    async fn message_meta(&self, id: &MessageId) -> Result<Option<MessageMeta>> {
        for entry in self.messages.iter() {
            if let Some(m) = entry.value().iter().find(|m| &m.id == id) {
                return Ok(Some(m.meta()));
            }
        }
        Ok(None)
    }

    async fn message_meta_batch(&self, ids: &[MessageId]) -> Result<Vec<MessageMeta>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(meta) = self.message_meta(id).await? {
                found.push(meta);
            }
        }
        Ok(found)
    }

    async fn messages_after_cursor(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<MessageMeta>> {
        let messages = match self.messages.get(conversation_id) {
            Some(m) => m,
            None => return Ok(Vec::new()),
        };
        Ok(messages
            .iter()
            .map(|m| m.meta())
            .filter(|meta| cursor.map_or(true, |c| !c.covers(meta)))
            .take(limit)
            .collect())
    }

    async fn recent_public_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let messages = match self.messages.get(conversation_id) {
            Some(m) => m,
            None => return Ok(Vec::new()),
        };
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.visibility == Visibility::Public)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_public_visitor_message_id(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageId>> {
        let messages = match self.messages.get(conversation_id) {
            Some(m) => m,
            None => return Ok(None),
        };
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.sender_type == SenderType::Visitor && m.visibility == Visibility::Public)
            .map(|m| m.id.clone()))
    }

    async fn search_knowledge(
        &self,
        organization_id: &OrganizationId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeSnippet>> {
        let needle = query.to_lowercase();
        let mut hits: Vec<KnowledgeSnippet> = self
            .knowledge
            .get(organization_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|s| {
                        s.title.to_lowercase().contains(&needle)
                            || s.content.to_lowercase().contains(&needle)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<InsertedMessage> {
        if let Some(key) = &message.idempotency_key {
            if let Some(existing_id) = self.idempotency.get(key).map(|id| id.clone()) {
                if let Some(existing) = self
                    .messages
                    .get(&message.conversation_id)
                    .and_then(|m| m.iter().find(|m| m.id == existing_id).cloned())
                {
                    return Ok(InsertedMessage {
                        message: existing,
                        created: false,
                    });
                }
            }
        }

        let stored = Message {
            id: self.generate_message_id(),
            conversation_id: message.conversation_id.clone(),
            created_at: Utc::now(),
            sender_type: message.sender_type,
            visibility: message.visibility,
            body_markdown: message.body_markdown,
        };
        if let Some(key) = message.idempotency_key {
            self.idempotency.insert(key, stored.id.clone());
        }
        self.seed_message(stored.clone());
        Ok(InsertedMessage {
            message: stored,
            created: true,
        })
    }

    async fn mark_conversation_seen(
        &self,
        conversation_id: &ConversationId,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        *self.seen.entry(conversation_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn update_ai_cursor(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| {
            c.ai_last_processed_message_id = Some(cursor.message_id.clone());
            c.ai_last_processed_message_created_at = Some(cursor.created_at);
        })
    }

    async fn update_ai_pause(
        &self,
        conversation_id: &ConversationId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| c.ai_paused_until = until)
    }

    async fn update_conversation_status(
        &self,
        conversation_id: &ConversationId,
        status: ConversationStatus,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| c.status = status)
    }

    async fn update_conversation_title(
        &self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| c.title = Some(title.to_string()))
    }

    async fn update_conversation_priority(
        &self,
        conversation_id: &ConversationId,
        priority: ConversationPriority,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| c.priority = Some(priority))
    }

    async fn update_conversation_sentiment(
        &self,
        conversation_id: &ConversationId,
        label: &str,
    ) -> Result<()> {
        self.with_conversation(conversation_id, |c| c.sentiment = Some(label.to_string()))
    }

    async fn update_agent_usage(&self, agent_id: &AgentId, usage: &TokenUsage) -> Result<()> {
        self.usage
            .entry(agent_id.clone())
            .or_default()
            .add(usage);
        Ok(())
    }
}
