//! The five-stage reply pipeline: intake → decision → generation →
//! execution → followup
//!
//! Stages run strictly in order for one effective trigger. The kill-switch
//! and the workflow registry are consulted between stages; a superseded run
//! stops without visitor-visible side effects. The typing heartbeat started
//! for generation is stopped on every exit path.

use crate::context::ContextBuilder;
use crate::decision::{decide_with_classifier, Decision, DecisionInput};
use crate::heartbeat::TypingHeartbeat;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use supportflow_core::{
    AgentId, AiAgent, Conversation, ConversationId, ConversationStatus, Database, Direction,
    EngineConfig, Error, EventRouting, GenerationPhase, Message, MessageMeta, OutboundEvent,
    RealtimeEmitter, RunId, TokenUsage, ToolCallState, TypingControl, Visitor, WorkflowStatus,
};
use supportflow_llm::{GenerateRequest, GenerateResponse, LanguageModel, LlmError, ToolDefinition};
use supportflow_store::{PauseFlag, WorkflowRegistry};
use supportflow_tools::{RunContext, ToolRegistry};
use tracing::{debug, info, warn};

/// Shared collaborators for pipeline runs.
pub struct PipelineDeps {
    pub db: Arc<dyn Database>,
    pub emitter: Arc<dyn RealtimeEmitter>,
    pub model: Arc<dyn LanguageModel>,
    pub classifier: Option<Arc<dyn LanguageModel>>,
    pub tools: Arc<ToolRegistry>,
    pub workflows: WorkflowRegistry,
    pub pause: PauseFlag,
    pub config: EngineConfig,
}

/// One effective trigger, possibly representing a coalesced visitor burst.
#[derive(Clone, Debug)]
pub struct PipelineInput {
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub effective: MessageMeta,
    pub coalesced_count: usize,
    pub run_id: RunId,
    pub direction: Direction,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Success {
        action: Option<String>,
        public_sends: usize,
    },
    /// Policy skip: the trigger is consumed without a reply.
    Skipped { reason: String },
    /// Kill-switch: nothing consumed, the drain stops.
    Paused,
    /// A newer trigger replaced this run; the drain re-peeks.
    Superseded,
    Failed {
        error: Error,
        public_sends: usize,
    },
}

impl PipelineOutcome {
    /// Whether the drain may retry this trigger (never after a public send).
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineOutcome::Failed {
                error,
                public_sends,
            } => error.is_retryable() && *public_sends == 0,
            _ => false,
        }
    }
}

struct ExecutionSummary {
    usage: TokenUsage,
    public_sends: usize,
    action: Option<String>,
}

pub struct Pipeline {
    deps: Arc<PipelineDeps>,
}

impl Pipeline {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    pub async fn run(&self, input: &PipelineInput) -> PipelineOutcome {
        let conversation = match self.deps.db.conversation_by_id(&input.conversation_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(conversation = %input.conversation_id, "pipeline: conversation missing");
                return PipelineOutcome::Failed {
                    error: Error::not_found(format!("conversation {}", input.conversation_id)),
                    public_sends: 0,
                };
            }
            Err(e) => {
                return PipelineOutcome::Failed {
                    error: e,
                    public_sends: 0,
                }
            }
        };

        let routing = EventRouting::from_conversation(&conversation);
        let outcome = self.run_staged(input, &conversation, &routing).await;
        self.emit_completion(&routing, &outcome);
        outcome
    }

    async fn run_staged(
        &self,
        input: &PipelineInput,
        conversation: &Conversation,
        routing: &EventRouting,
    ) -> PipelineOutcome {
        let deps = &self.deps;
        let now = Utc::now();

        // ---- intake ----
        match deps.pause.is_paused(conversation, now).await {
            Ok(true) => return PipelineOutcome::Paused,
            Ok(false) => {}
            Err(e) => return fail(e, 0),
        }

        let agent = match deps.db.agent_by_id(&input.agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                return fail(
                    Error::not_found(format!("ai agent {}", input.agent_id)),
                    0,
                )
            }
            Err(e) => return fail(e, 0),
        };
        if !agent.is_active {
            return PipelineOutcome::Skipped {
                reason: "agent inactive".to_string(),
            };
        }
        match conversation.status {
            ConversationStatus::Open => {}
            ConversationStatus::Resolved => {
                return PipelineOutcome::Skipped {
                    reason: "conversation resolved".to_string(),
                }
            }
            ConversationStatus::Spam => {
                return PipelineOutcome::Skipped {
                    reason: "conversation marked spam".to_string(),
                }
            }
        }

        let newest_first = match deps
            .db
            .recent_public_messages(&conversation.id, deps.config.max_context_messages)
            .await
        {
            Ok(messages) => messages,
            Err(e) => return fail(e, 0),
        };
        let history: Vec<Message> = newest_first.into_iter().rev().collect();
        let trigger_body = history
            .iter()
            .find(|m| m.id == input.effective.id)
            .map(|m| m.body_markdown.clone())
            .unwrap_or_default();

        let visitor: Option<Visitor> = match &conversation.visitor_id {
            Some(id) => match deps.db.visitor_with_contact(id).await {
                Ok(v) => v,
                Err(e) => return fail(e, 0),
            },
            None => None,
        };

        // ---- decision ----
        match deps
            .workflows
            .is_active(&conversation.id, input.direction, &input.run_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return PipelineOutcome::Superseded,
            Err(e) => return fail(e, 0),
        }

        let decision_input = DecisionInput {
            conversation,
            agent: &agent,
            trigger: &input.effective,
            trigger_body: &trigger_body,
            history: &history,
            coalesced_count: input.coalesced_count,
            proactive_wait: deps.config.proactive_wait,
            now,
        };
        let decision =
            decide_with_classifier(&decision_input, deps.classifier.as_deref()).await;
        deps.emitter.emit(OutboundEvent::decision_made(
            routing.clone(),
            decision.should_act,
            decision.mode,
            decision.reason.as_str(),
        ));
        if !decision.should_act {
            return PipelineOutcome::Skipped {
                reason: decision.reason,
            };
        }

        // Kill-switch between stages.
        match deps.pause.is_paused(conversation, Utc::now()).await {
            Ok(true) => return PipelineOutcome::Paused,
            Ok(false) => {}
            Err(e) => return fail(e, 0),
        }

        // ---- generation + execution, heartbeat-wrapped ----
        let typing_routing = conversation.visitor_id.is_some().then(|| routing.clone());
        let heartbeat = Arc::new(TypingHeartbeat::new(
            deps.emitter.clone(),
            typing_routing,
            deps.config.heartbeat_interval,
        ));
        heartbeat.start().await;

        let staged = self
            .generate_and_execute(
                input,
                conversation,
                &agent,
                &decision,
                visitor.as_ref(),
                routing,
                heartbeat.clone(),
            )
            .await;

        // Guaranteed stop on every exit path; a no-op when the first public
        // send already stopped the indicator.
        heartbeat.stop().await;

        let summary = match staged {
            Ok(summary) => summary,
            Err(outcome) => return outcome,
        };

        // ---- followup ----
        let cursor = input.effective.cursor();
        if let Err(e) = deps.db.update_ai_cursor(&conversation.id, &cursor).await {
            return fail(e, summary.public_sends);
        }
        if let Err(e) = deps.db.update_agent_usage(&agent.id, &summary.usage).await {
            warn!("failed to update agent usage: {}", e);
        }
        if !deps.config.update_seen_on_skip {
            // Seen marker only moves for acting runs in this mode.
            if let Err(e) = deps
                .db
                .mark_conversation_seen(&conversation.id, Utc::now())
                .await
            {
                warn!("failed to mark conversation seen: {}", e);
            }
        }
        if let Err(e) = deps
            .workflows
            .clear_if_active(&conversation.id, input.direction, &input.run_id)
            .await
        {
            warn!("failed to clear workflow state: {}", e);
        }

        info!(
            conversation = %conversation.id,
            run = %input.run_id,
            sends = summary.public_sends,
            "pipeline run complete"
        );
        PipelineOutcome::Success {
            action: summary.action,
            public_sends: summary.public_sends,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_and_execute(
        &self,
        input: &PipelineInput,
        conversation: &Conversation,
        agent: &AiAgent,
        decision: &Decision,
        visitor: Option<&Visitor>,
        routing: &EventRouting,
        heartbeat: Arc<TypingHeartbeat>,
    ) -> Result<ExecutionSummary, PipelineOutcome> {
        let deps = &self.deps;

        // ---- generation ----
        deps.emitter.emit(OutboundEvent::generation_progress(
            routing.clone(),
            GenerationPhase::Thinking,
        ));

        let built = ContextBuilder::new(deps.config.max_context_messages)
            .build(deps.db.as_ref(), conversation, visitor)
            .await
            .map_err(|e| fail(e, 0))?;

        let tools = deps.tools.definitions_for_agent(agent);
        let system = compose_system_prompt(agent, &built.visitor_block, tools.as_deref());

        deps.emitter.emit(OutboundEvent::generation_progress(
            routing.clone(),
            GenerationPhase::Generating,
        ));

        let request = GenerateRequest {
            model: agent.model.clone(),
            system: Some(system),
            messages: built.messages,
            tools,
            temperature: agent.temperature,
            max_output_tokens: agent.max_output_tokens,
        };

        let cancel = deps.workflows.cancel_token(&input.run_id);
        let response: GenerateResponse = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(run = %input.run_id, "generation cancelled by supersede");
                return Err(PipelineOutcome::Superseded);
            }
            result = tokio::time::timeout(deps.config.llm_timeout, deps.model.generate(request)) => {
                match result {
                    Ok(Ok(response)) => response,
                    Ok(Err(LlmError::Cancelled)) => return Err(PipelineOutcome::Superseded),
                    Ok(Err(e)) => return Err(fail(e.into(), 0)),
                    Err(_) => return Err(fail(Error::Timeout("language model call".into()), 0)),
                }
            }
        };

        deps.emitter.emit(OutboundEvent::generation_progress(
            routing.clone(),
            GenerationPhase::Finalizing,
        ));

        // Supersede check between generation and execution: a newer trigger
        // must win before anything becomes visitor-visible.
        match deps
            .workflows
            .is_active(&conversation.id, input.direction, &input.run_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(PipelineOutcome::Superseded),
            Err(e) => return Err(fail(e, 0)),
        }

        // ---- execution ----
        let ctx = RunContext::new(
            conversation.clone(),
            agent.clone(),
            input.run_id.clone(),
            input.effective.id.clone(),
            input.effective.created_at,
            input.effective.sender_type,
            input.effective.visibility,
            deps.db.clone(),
            deps.emitter.clone(),
            heartbeat,
        )
        .with_restart_typing(deps.config.restart_typing_between_sends);

        // Low-confidence replies become an escalation instead of a send.
        let threshold = deps.config.escalation_confidence_threshold;
        if decision.confidence < threshold && wants_public_reply(&response) {
            warn!(
                conversation = %conversation.id,
                confidence = decision.confidence,
                "confidence below threshold; auto-escalating instead of replying"
            );
            self.run_tool(
                &ctx,
                routing,
                "escalate_to_human",
                json!({
                    "reason": format!("reply confidence {:.2} below threshold", decision.confidence)
                }),
            )
            .await;
            return Ok(ExecutionSummary {
                usage: response.usage,
                public_sends: ctx.public_send_count().await,
                action: ctx.recorded_action().await.or(Some("auto_escalated".into())),
            });
        }

        for call in &response.tool_calls {
            self.run_tool(&ctx, routing, &call.name, call.arguments.clone())
                .await;
        }

        // Any non-tool-sent assistant text persists as one message. Going
        // through the send path gives it the same dedup and idempotency.
        if let Some(text) = &response.text {
            if !text.trim().is_empty() && ctx.allow_public_messages {
                let result = deps
                    .tools
                    .execute(&ctx, "send_visitor_message", json!({ "message": text }))
                    .await;
                if let Some(message) = result_error(&result) {
                    warn!("failed to persist assistant reply: {}", message);
                }
            }
        }

        Ok(ExecutionSummary {
            usage: response.usage,
            public_sends: ctx.public_send_count().await,
            action: ctx.recorded_action().await,
        })
    }

    async fn run_tool(
        &self,
        ctx: &RunContext,
        routing: &EventRouting,
        name: &str,
        args: serde_json::Value,
    ) {
        let deps = &self.deps;
        let progress = deps
            .tools
            .get(name)
            .and_then(|tool| tool.progress_message().map(String::from));

        deps.emitter.emit(OutboundEvent::tool_progress(
            routing.clone(),
            name,
            ToolCallState::Started,
            progress.clone(),
        ));

        let result = deps.tools.execute(ctx, name, args).await;
        if let Some(message) = result_error(&result) {
            warn!(tool = name, "tool failed: {}", message);
        }

        deps.emitter.emit(OutboundEvent::tool_progress(
            routing.clone(),
            name,
            ToolCallState::Finished,
            progress,
        ));
    }

    fn emit_completion(&self, routing: &EventRouting, outcome: &PipelineOutcome) {
        let event = match outcome {
            PipelineOutcome::Success {
                action,
                ..
            } => OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Success,
                action.clone(),
                None,
            ),
            PipelineOutcome::Skipped { reason } => OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Skipped,
                None,
                Some(reason.clone()),
            ),
            PipelineOutcome::Paused => OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Skipped,
                None,
                Some("ai paused".to_string()),
            ),
            PipelineOutcome::Superseded => OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Cancelled,
                None,
                Some("superseded by a newer trigger".to_string()),
            ),
            PipelineOutcome::Failed { error, .. } => OutboundEvent::workflow_completed(
                routing.clone(),
                WorkflowStatus::Error,
                None,
                Some(error.to_string()),
            ),
        };
        self.deps.emitter.emit(event);
    }
}

fn fail(error: Error, public_sends: usize) -> PipelineOutcome {
    PipelineOutcome::Failed {
        error,
        public_sends,
    }
}

fn result_error(result: &supportflow_tools::ToolResult) -> Option<&str> {
    match result {
        supportflow_tools::ToolResult::Error(message) => Some(message),
        supportflow_tools::ToolResult::Json(_) => None,
    }
}

fn wants_public_reply(response: &GenerateResponse) -> bool {
    response
        .text
        .as_ref()
        .is_some_and(|t| !t.trim().is_empty())
        || response
            .tool_calls
            .iter()
            .any(|call| call.name == "send_visitor_message")
}

fn compose_system_prompt(
    agent: &AiAgent,
    visitor_block: &str,
    tools: Option<&[ToolDefinition]>,
) -> String {
    let mut prompt = agent.base_prompt.trim().to_string();

    if !visitor_block.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(visitor_block);
    }

    match tools {
        Some(definitions) => {
            prompt.push_str("\n\n## Tools\n");
            for definition in definitions {
                prompt.push_str(&format!("- {}: {}\n", definition.name, definition.description));
            }
            prompt.push_str(
                "\nUse send_visitor_message for every visitor-visible reply. \
                 Plain response text is also delivered to the visitor.",
            );
        }
        None => {
            prompt.push_str("\n\nYou have no tools available; reply with plain text only.");
        }
    }

    prompt
}
