//! Run context and the per-run send ledger
//!
//! The ledger is a field on the context, not a closed-over variable: it
//! tracks the monotonically increasing send slot, the normalized bodies
//! already sent this run, and how many public messages went out.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use supportflow_core::{
    AiAgent, Conversation, ConversationId, Database, EventRouting, MessageId, RealtimeEmitter,
    RunId, SenderType, TypingControl, Visibility,
};
use tokio::sync::Mutex;

/// Whitespace-collapsed, lowercased form used for duplicate detection.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Idempotency key for one logical outgoing message. The slot index, not
/// the text, binds identity, so a retried slot with different wording still
/// collapses to one external message.
pub fn slot_key(conversation_id: &ConversationId, trigger_id: &MessageId, slot: usize) -> String {
    format!("send:{}:{}:slot:{}", conversation_id, trigger_id, slot)
}

/// Outcome of asking the ledger for a send slot.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotReservation {
    Slot(usize),
    /// The normalized text was already sent earlier in this run.
    Duplicate,
}

#[derive(Default)]
pub struct SendLedger {
    next_slot: usize,
    normalized: HashSet<String>,
    public_sent: usize,
}

impl SendLedger {
    pub fn reserve(&mut self, normalized: &str) -> SlotReservation {
        if !self.normalized.insert(normalized.to_string()) {
            return SlotReservation::Duplicate;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        SlotReservation::Slot(slot)
    }

    pub fn note_public_send(&mut self) -> usize {
        self.public_sent += 1;
        self.public_sent
    }

    pub fn public_sent(&self) -> usize {
        self.public_sent
    }
}

/// Everything a tool needs to act on the conversation for one pipeline run.
pub struct RunContext {
    pub conversation: Conversation,
    pub agent: AiAgent,
    pub run_id: RunId,
    pub trigger_message_id: MessageId,
    pub trigger_created_at: DateTime<Utc>,
    pub trigger_sender: SenderType,
    pub trigger_visibility: Visibility,
    /// False when the trigger context forbids visitor-visible output.
    pub allow_public_messages: bool,
    /// Restart the typing indicator after each send instead of only stopping
    /// it on the first one.
    pub restart_typing_between_sends: bool,
    pub db: Arc<dyn Database>,
    pub emitter: Arc<dyn RealtimeEmitter>,
    pub typing: Arc<dyn TypingControl>,
    ledger: Mutex<SendLedger>,
    sends_paused: AtomicBool,
    recorded_action: Mutex<Option<String>>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversation: Conversation,
        agent: AiAgent,
        run_id: RunId,
        trigger_message_id: MessageId,
        trigger_created_at: DateTime<Utc>,
        trigger_sender: SenderType,
        trigger_visibility: Visibility,
        db: Arc<dyn Database>,
        emitter: Arc<dyn RealtimeEmitter>,
        typing: Arc<dyn TypingControl>,
    ) -> Self {
        let allow_public_messages = trigger_visibility == Visibility::Public;
        Self {
            conversation,
            agent,
            run_id,
            trigger_message_id,
            trigger_created_at,
            trigger_sender,
            trigger_visibility,
            allow_public_messages,
            restart_typing_between_sends: false,
            db,
            emitter,
            typing,
            ledger: Mutex::new(SendLedger::default()),
            sends_paused: AtomicBool::new(false),
            recorded_action: Mutex::new(None),
        }
    }

    pub fn with_restart_typing(mut self, restart: bool) -> Self {
        self.restart_typing_between_sends = restart;
        self
    }

    pub fn routing(&self) -> EventRouting {
        EventRouting::from_conversation(&self.conversation)
    }

    /// Reserve a slot for `normalized`, or report it as a duplicate.
    pub async fn reserve_slot(&self, normalized: &str) -> SlotReservation {
        self.ledger.lock().await.reserve(normalized)
    }

    /// Record one public send; returns the running count (1 for the first).
    pub async fn note_public_send(&self) -> usize {
        self.ledger.lock().await.note_public_send()
    }

    pub async fn public_send_count(&self) -> usize {
        self.ledger.lock().await.public_sent()
    }

    /// Drop all subsequent sends in this run.
    pub fn pause_sends(&self) {
        self.sends_paused.store(true, Ordering::SeqCst);
    }

    pub fn sends_paused(&self) -> bool {
        self.sends_paused.load(Ordering::SeqCst)
    }

    /// Record the headline action for this run (e.g. "escalated"); surfaced
    /// on the workflow-completed event.
    pub async fn record_action(&self, action: impl Into<String>) {
        let mut recorded = self.recorded_action.lock().await;
        if recorded.is_none() {
            *recorded = Some(action.into());
        }
    }

    pub async fn recorded_action(&self) -> Option<String> {
        self.recorded_action.lock().await.clone()
    }
}
