//! Decision stage — should the agent act, and how
//!
//! A deterministic rule walk runs first; only when no rule fires is the
//! optional lightweight classifier consulted. Rules always win over the
//! model.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use supportflow_core::{
    AiAgent, Conversation, Message, MessageMeta, ResponseMode, SenderType,
};
use supportflow_llm::{ChatMessage, GenerateRequest, LanguageModel};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct Decision {
    pub should_act: bool,
    pub mode: ResponseMode,
    pub reason: String,
    /// Rule decisions are certain; classifier decisions carry its estimate.
    pub confidence: f32,
}

impl Decision {
    fn silent(reason: impl Into<String>) -> Self {
        Self {
            should_act: false,
            mode: ResponseMode::Silent,
            reason: reason.into(),
            confidence: 1.0,
        }
    }

    fn reply(reason: impl Into<String>) -> Self {
        Self {
            should_act: true,
            mode: ResponseMode::Reply,
            reason: reason.into(),
            confidence: 1.0,
        }
    }

    fn proactive(reason: impl Into<String>) -> Self {
        Self {
            should_act: true,
            mode: ResponseMode::ProactiveReply,
            reason: reason.into(),
            confidence: 1.0,
        }
    }
}

pub struct DecisionInput<'a> {
    pub conversation: &'a Conversation,
    pub agent: &'a AiAgent,
    pub trigger: &'a MessageMeta,
    pub trigger_body: &'a str,
    /// Public history, chronological, including the trigger.
    pub history: &'a [Message],
    pub coalesced_count: usize,
    pub proactive_wait: Duration,
    pub now: DateTime<Utc>,
}

fn human_request_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:speak|talk|chat)\s+(?:to|with)\s+(?:a\s+|an\s+)?(?:human|person|agent|representative|someone)\b|\breal\s+(?:person|human)\b|\bhuman\s+(?:agent|support|being)\b",
        )
        .expect("human request pattern")
    })
}

fn batched_reason(base: &str, coalesced_count: usize) -> String {
    if coalesced_count > 1 {
        format!("batched {} visitor messages", coalesced_count)
    } else {
        base.to_string()
    }
}

/// Deterministic rules only. Returns None when no rule fires and a
/// classifier may refine the default.
fn apply_rules(input: &DecisionInput<'_>) -> Option<Decision> {
    if !input.trigger.is_triggerable() {
        return Some(Decision::silent("non-visitor trigger advances context only"));
    }

    if input.conversation.has_human_assignee() {
        return Some(Decision::silent("a human teammate is assigned"));
    }

    if human_request_pattern().is_match(input.trigger_body) {
        return Some(Decision::reply("visitor asked for a human"));
    }

    // Proactive: a brand-new conversation gets a greeting.
    let prior_messages = input
        .history
        .iter()
        .filter(|m| m.id != input.trigger.id)
        .count();
    if prior_messages == 0 && input.trigger_body.trim().is_empty() {
        return Some(Decision::proactive("greeting a new conversation"));
    }

    // Proactive: visitor has waited past the threshold with no reply.
    let has_reply_after_trigger = input.history.iter().any(|m| {
        m.sender_type != SenderType::Visitor && m.created_at >= input.trigger.created_at
    });
    let waited = (input.now - input.trigger.created_at)
        .to_std()
        .unwrap_or_default();
    if !has_reply_after_trigger && waited >= input.proactive_wait {
        return Some(Decision {
            should_act: true,
            mode: ResponseMode::ProactiveReply,
            reason: batched_reason("visitor waiting without a reply", input.coalesced_count),
            confidence: 1.0,
        });
    }

    None
}

/// Rule-only decision: the default when no rule fires is to reply.
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    if let Some(decision) = apply_rules(input) {
        debug!(reason = %decision.reason, "decision made by rule");
        return decision;
    }
    Decision {
        should_act: true,
        mode: ResponseMode::Reply,
        reason: batched_reason("replying to visitor message", input.coalesced_count),
        confidence: 1.0,
    }
}

/// Rules first; an ambiguous case consults the classifier. Classifier
/// failures fall back to the rule default; the pipeline never dies on the
/// cheap model.
pub async fn decide_with_classifier(
    input: &DecisionInput<'_>,
    classifier: Option<&dyn LanguageModel>,
) -> Decision {
    if let Some(decision) = apply_rules(input) {
        return decision;
    }

    let classifier = match classifier {
        Some(c) => c,
        None => return decide(input),
    };

    let request = GenerateRequest {
        model: input.agent.model.clone(),
        system: Some(
            "You triage a customer-support conversation. Answer with REPLY or \
             SILENT followed by a confidence between 0 and 1, e.g. \"REPLY 0.9\". \
             Answer SILENT only when the message clearly needs no response."
                .to_string(),
        ),
        messages: vec![ChatMessage::user(input.trigger_body.to_string())],
        tools: None,
        temperature: Some(0.0),
        max_output_tokens: Some(16),
    };

    match classifier.generate(request).await {
        Ok(response) => {
            let raw = response.text.unwrap_or_default();
            match parse_classifier_output(&raw) {
                Some((true, confidence)) => Decision {
                    should_act: true,
                    mode: ResponseMode::Reply,
                    reason: batched_reason("classifier chose to reply", input.coalesced_count),
                    confidence,
                },
                Some((false, confidence)) => Decision {
                    should_act: false,
                    mode: ResponseMode::Silent,
                    reason: "classifier chose silence".to_string(),
                    confidence,
                },
                None => {
                    warn!(output = %raw, "unparsable classifier output; defaulting to reply");
                    decide(input)
                }
            }
        }
        Err(e) => {
            warn!("decision classifier failed: {}; defaulting to reply", e);
            decide(input)
        }
    }
}

fn parse_classifier_output(raw: &str) -> Option<(bool, f32)> {
    let mut parts = raw.split_whitespace();
    let verdict = match parts.next()?.to_ascii_uppercase().as_str() {
        "REPLY" => true,
        "SILENT" => false,
        _ => return None,
    };
    let confidence = parts
        .next()
        .and_then(|c| c.parse::<f32>().ok())
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    Some((verdict, confidence))
}
