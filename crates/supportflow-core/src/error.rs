//! Error types for supportflow

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("llm error: {message}")]
    Llm { message: String, retryable: bool },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("run superseded by a newer trigger")]
    Superseded,

    #[error("lock renewal failed for conversation {0}")]
    LockLost(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn llm(message: impl Into<String>, retryable: bool) -> Self {
        Self::Llm {
            message: message.into(),
            retryable,
        }
    }

    /// Whether the drain worker may retry the trigger. Transient failures
    /// retry up to the threshold; validation and policy failures drop.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(_) | Error::Store(_) | Error::Timeout(_) => true,
            Error::Llm { retryable, .. } => *retryable,
            Error::LockLost(_) => false,
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::Superseded
            | Error::Json(_)
            | Error::Internal(_) => false,
        }
    }
}
