//! supportflow worker — env wiring for the drain scheduler
//!
//! Picks the Redis store when `REDIS_URL` is set (in-memory otherwise, for
//! local runs), the Anthropic provider from `ANTHROPIC_API_KEY`, and runs
//! the engine until interrupted. The host application drives the producer
//! with triggers; this binary is the standalone worker shell.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{EngineConfig, MemoryDatabase};
use supportflow_engine::{BufferedEmitter, Engine};
use supportflow_llm::AnthropicModel;
use supportflow_store::{KvStore, MemoryStore, RedisStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();

    let kv: Arc<dyn KvStore> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            info!("connecting to redis store");
            Arc::new(
                RedisStore::connect(&url)
                    .await
                    .context("connecting to REDIS_URL")?,
            )
        }
        Err(_) => {
            warn!("REDIS_URL not set; using the in-memory store (single process only)");
            Arc::new(MemoryStore::new())
        }
    };

    let api_key =
        std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY must be set")?;
    let model = Arc::new(AnthropicModel::new(api_key).with_timeout(config.llm_timeout));

    // The transactional database adapter is injected by the host application
    // when supportflow is embedded; the standalone worker runs on the
    // in-memory database.
    let db = Arc::new(MemoryDatabase::new());
    let emitter = Arc::new(BufferedEmitter::spawn_logging(1024));

    let engine = Engine::start(
        db,
        kv,
        model,
        None,
        emitter,
        supportflow_tools::create_default_registry(),
        config,
    );
    info!("supportflow worker ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    engine.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
