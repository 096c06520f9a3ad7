//! Engine configuration, loaded from `AI_AGENT_*` environment variables

use std::time::Duration;

/// All tunables for the drain scheduler and pipeline. Numeric env vars fall
/// back to the documented defaults when unset or unparsable.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Parallel drain workers (`AI_AGENT_CONCURRENCY`).
    pub concurrency: usize,
    /// Job-level lease used by the dispatcher watchdog (`AI_AGENT_LOCK_DURATION_MS`).
    pub lock_duration: Duration,
    /// Watchdog probe interval (`AI_AGENT_STALLED_INTERVAL_MS`).
    pub stalled_interval: Duration,
    /// Probes past the lease before a job is reported stalled (`AI_AGENT_MAX_STALLED_COUNT`).
    pub max_stalled_count: u32,
    /// Max triggers consumed in one drain (`AI_AGENT_DRAIN_MAX_MESSAGES`).
    pub drain_max_messages: usize,
    /// Wall-clock cap for one drain (`AI_AGENT_DRAIN_MAX_RUNTIME_MS`).
    pub drain_max_runtime: Duration,
    /// Drain lock TTL (`AI_AGENT_DRAIN_LOCK_TTL_MS`).
    pub drain_lock_ttl: Duration,
    /// Debounce before coalescing visitor bursts (`AI_AGENT_VISITOR_DEBOUNCE_MS`).
    pub visitor_debounce: Duration,
    /// Max queued ids examined per coalescing pass.
    pub coalesce_batch_limit: usize,
    /// Transient failures tolerated per trigger before it is dropped.
    pub retry_threshold: u32,
    /// Failure counter TTL.
    pub failure_ttl: Duration,
    /// Typing heartbeat period (`AI_AGENT_HEARTBEAT_INTERVAL_MS`).
    pub heartbeat_interval: Duration,
    /// Public timeline messages given to the model as context.
    pub max_context_messages: usize,
    /// Page size when hydrating the queue from the DB cursor.
    pub hydrate_page_limit: usize,
    /// Workflow dedup record TTL.
    pub workflow_ttl: Duration,
    /// Visitor wait that makes an unanswered conversation proactive.
    pub proactive_wait: Duration,
    /// Wall-clock timeout for one model call (`AI_AGENT_LLM_TIMEOUT_MS`).
    pub llm_timeout: Duration,
    /// Decision confidence below which replies become auto-escalations
    /// (`AI_AGENT_ESCALATION_CONFIDENCE`).
    pub escalation_confidence_threshold: f32,
    /// Mark the conversation seen even when the decision is not to act
    /// (`AI_AGENT_UPDATE_SEEN_ON_SKIP`).
    pub update_seen_on_skip: bool,
    /// Restart the typing indicator for sends after the first one
    /// (`AI_AGENT_RESTART_TYPING`).
    pub restart_typing_between_sends: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            lock_duration: Duration::from_millis(60_000),
            stalled_interval: Duration::from_millis(30_000),
            max_stalled_count: 2,
            drain_max_messages: 20,
            drain_max_runtime: Duration::from_millis(45_000),
            drain_lock_ttl: Duration::from_millis(60_000),
            visitor_debounce: Duration::from_millis(250),
            coalesce_batch_limit: 10,
            retry_threshold: 3,
            failure_ttl: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_millis(4_000),
            max_context_messages: 20,
            hydrate_page_limit: 500,
            workflow_ttl: Duration::from_secs(24 * 3600),
            proactive_wait: Duration::from_secs(300),
            llm_timeout: Duration::from_millis(30_000),
            escalation_confidence_threshold: 0.6,
            update_seen_on_skip: true,
            restart_typing_between_sends: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_usize("AI_AGENT_CONCURRENCY", defaults.concurrency),
            lock_duration: env_ms("AI_AGENT_LOCK_DURATION_MS", defaults.lock_duration),
            stalled_interval: env_ms("AI_AGENT_STALLED_INTERVAL_MS", defaults.stalled_interval),
            max_stalled_count: env_u32("AI_AGENT_MAX_STALLED_COUNT", defaults.max_stalled_count),
            drain_max_messages: env_usize(
                "AI_AGENT_DRAIN_MAX_MESSAGES",
                defaults.drain_max_messages,
            ),
            drain_max_runtime: env_ms("AI_AGENT_DRAIN_MAX_RUNTIME_MS", defaults.drain_max_runtime),
            drain_lock_ttl: env_ms("AI_AGENT_DRAIN_LOCK_TTL_MS", defaults.drain_lock_ttl),
            visitor_debounce: env_ms("AI_AGENT_VISITOR_DEBOUNCE_MS", defaults.visitor_debounce),
            heartbeat_interval: env_ms(
                "AI_AGENT_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            retry_threshold: env_u32("AI_AGENT_RETRY_THRESHOLD", defaults.retry_threshold),
            llm_timeout: env_ms("AI_AGENT_LLM_TIMEOUT_MS", defaults.llm_timeout),
            escalation_confidence_threshold: env_f32(
                "AI_AGENT_ESCALATION_CONFIDENCE",
                defaults.escalation_confidence_threshold,
            ),
            update_seen_on_skip: env_bool(
                "AI_AGENT_UPDATE_SEEN_ON_SKIP",
                defaults.update_seen_on_skip,
            ),
            restart_typing_between_sends: env_bool(
                "AI_AGENT_RESTART_TYPING",
                defaults.restart_typing_between_sends,
            ),
            ..defaults
        }
    }
}

fn env_raw(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_usize(name: &str, default: usize) -> usize {
    env_raw(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_raw(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    env_raw(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_ms(name: &str, default: Duration) -> Duration {
    env_raw(name)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_raw(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}
