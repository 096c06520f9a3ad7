//! Shared-state store for the conversation pipeline
//!
//! The queue, drain lock, kill-switch, failure counters, and workflow dedup
//! registry all live in a Redis-like key-value store, abstracted behind the
//! small `KvStore` interface so the engine is testable against the in-memory
//! fake.

pub mod failures;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod pause;
pub mod queue;
pub mod redis_store;
pub mod workflow;

pub use failures::FailureCounter;
pub use kv::{keys, KvStore};
pub use lock::DrainLock;
pub use memory::MemoryStore;
pub use pause::PauseFlag;
pub use queue::TriggerQueue;
pub use redis_store::RedisStore;
pub use workflow::{TriggerOutcome, WorkflowRegistry};
