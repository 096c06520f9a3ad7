//! LanguageModel provider trait

use crate::types::{GenerateRequest, GenerateResponse};

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types, classified retryable or fatal for the drain worker.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl LlmError {
    /// Rate limits, 5xx, timeouts, and transport failures retry; validation
    /// and auth failures do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Upstream { status, .. } => *status == 429 || *status >= 500,
            LlmError::Timeout { .. } | LlmError::Network(_) => true,
            LlmError::AuthFailed(_) | LlmError::InvalidResponse(_) | LlmError::Cancelled => false,
        }
    }
}

impl From<LlmError> for supportflow_core::Error {
    fn from(e: LlmError) -> Self {
        let retryable = e.is_retryable();
        supportflow_core::Error::llm(e.to_string(), retryable)
    }
}

/// A language model that answers one request atomically: text plus any tool
/// calls plus usage. Providers enforce their own wall-clock timeout and
/// surface it as a retryable error.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse>;
}
