//! Coalescing policy — merge a burst of consecutive visitor messages
//!
//! Only consecutive public visitor triggers are eligible. After a short
//! debounce, the head of the queue and any visitor siblings queued right
//! behind it collapse into one pipeline run whose effective trigger is the
//! last included message. Human and AI messages never coalesce and never
//! trigger runs themselves.

use supportflow_core::{Database, EngineConfig, MessageId, MessageMeta, Result};
use supportflow_store::TriggerQueue;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct CoalesceOutcome {
    /// The message the pipeline treats as its input.
    pub effective: MessageMeta,
    /// Every id merged into this run, head first. Removed together on
    /// success.
    pub coalesced: Vec<MessageId>,
}

pub async fn coalesce_visitor_burst(
    db: &dyn Database,
    queue: &TriggerQueue,
    config: &EngineConfig,
    head: &MessageMeta,
) -> Result<CoalesceOutcome> {
    // Give an actively typing visitor a moment to finish the burst.
    tokio::time::sleep(config.visitor_debounce).await;

    let ids = queue
        .peek_batch(&head.conversation_id, config.coalesce_batch_limit)
        .await?;
    let metas = db.message_meta_batch(&ids).await?;

    let head_key = (head.created_at, head.id.as_str().to_string());
    let mut effective = head.clone();
    let mut coalesced = vec![head.id.clone()];

    for (id, meta) in ids.iter().zip(metas.iter()).skip(1) {
        if meta.id != *id {
            // Metadata came back out of step with the queue; stop at the gap.
            break;
        }
        let key = (meta.created_at, meta.id.as_str().to_string());
        if !meta.is_triggerable() || key < head_key {
            break;
        }
        coalesced.push(meta.id.clone());
        effective = meta.clone();
    }

    if coalesced.len() > 1 {
        debug!(
            conversation = %head.conversation_id,
            batch = coalesced.len(),
            effective = %effective.id,
            "coalesced visitor burst"
        );
    }

    Ok(CoalesceOutcome {
        effective,
        coalesced,
    })
}
