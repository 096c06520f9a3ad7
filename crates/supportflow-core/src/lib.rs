//! Core types for the supportflow conversation pipeline

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod types;

pub use config::EngineConfig;
pub use db::{Database, InsertedMessage, MemoryDatabase};
pub use error::{Error, Result};
pub use events::{
    Audience, EventKind, EventRouting, GenerationPhase, OutboundEvent, RealtimeEmitter,
    ToolCallState, TypingControl, WorkflowStatus,
};
pub use types::*;
