//! Scripted model for tests: queued canned responses, recorded requests

use crate::provider::{LanguageModel, LlmError, LlmResult};
use crate::types::{GenerateRequest, GenerateResponse};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

enum Outcome {
    Response(GenerateResponse),
    TransientError(String),
    FatalError(String),
}

struct Step {
    outcome: Outcome,
    /// Simulated generation latency; lets tests supersede a run mid-call.
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(GenerateResponse::text_only(text));
    }

    pub fn push_response(&self, response: GenerateResponse) {
        self.push_step(Outcome::Response(response), None);
    }

    pub fn push_delayed_response(&self, response: GenerateResponse, delay: Duration) {
        self.push_step(Outcome::Response(response), Some(delay));
    }

    /// A 503 the drain worker should retry.
    pub fn push_transient_error(&self, message: impl Into<String>) {
        self.push_step(Outcome::TransientError(message.into()), None);
    }

    /// A validation failure the drain worker must not retry.
    pub fn push_fatal_error(&self, message: impl Into<String>) {
        self.push_step(Outcome::FatalError(message.into()), None);
    }

    fn push_step(&self, outcome: Outcome, delay: Option<Duration>) {
        self.steps
            .lock()
            .expect("scripted model poisoned")
            .push_back(Step { outcome, delay });
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .expect("scripted model poisoned")
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .expect("scripted model poisoned")
            .len()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse> {
        self.requests
            .lock()
            .expect("scripted model poisoned")
            .push(request);

        let step = self
            .steps
            .lock()
            .expect("scripted model poisoned")
            .pop_front();
        let step = match step {
            Some(s) => s,
            None => return Ok(GenerateResponse::default()),
        };

        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }

        match step.outcome {
            Outcome::Response(response) => Ok(response),
            Outcome::TransientError(message) => Err(LlmError::Upstream {
                status: 503,
                message,
            }),
            Outcome::FatalError(message) => Err(LlmError::InvalidResponse(message)),
        }
    }
}
