//! Typing heartbeat
//!
//! Keeps the visitor-visible typing indicator alive during long model runs:
//! an immediate typing=true, then one every interval until stopped. The
//! client expires the indicator on its own TTL, so a lost stop publish
//! degrades gracefully — but stop still retries twice before giving up.
//!
//! The ticker is cancelled before the final typing=false publish so a late
//! tick can never race past the stop.

use std::sync::Arc;
use std::time::Duration;
use supportflow_core::{EventRouting, OutboundEvent, RealtimeEmitter, TypingControl};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const STOP_RETRIES: usize = 2;
const STOP_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TypingHeartbeat {
    emitter: Arc<dyn RealtimeEmitter>,
    /// None when routing fields were missing; emission is suppressed.
    routing: Option<EventRouting>,
    interval: Duration,
    ticker: Mutex<Option<CancellationToken>>,
}

impl TypingHeartbeat {
    pub fn new(
        emitter: Arc<dyn RealtimeEmitter>,
        routing: Option<EventRouting>,
        interval: Duration,
    ) -> Self {
        if routing.is_none() {
            error!("typing heartbeat missing routing fields; emission suppressed");
        }
        Self {
            emitter,
            routing,
            interval,
            ticker: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl TypingControl for TypingHeartbeat {
    async fn start(&self) {
        let routing = match &self.routing {
            Some(r) => r.clone(),
            None => return,
        };

        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            // Already running.
            return;
        }

        self.emitter
            .emit(OutboundEvent::typing(routing.clone(), true));

        let token = CancellationToken::new();
        let tick_token = token.clone();
        let emitter = self.emitter.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        emitter.emit(OutboundEvent::typing(routing.clone(), true));
                    }
                }
            }
        });
        *ticker = Some(token);
    }

    async fn stop(&self) {
        let routing = match &self.routing {
            Some(r) => r.clone(),
            None => return,
        };

        let token = self.ticker.lock().await.take();
        let token = match token {
            Some(t) => t,
            // Never started, or already stopped: exactly-one-stop holds.
            None => return,
        };
        token.cancel();

        for attempt in 0..=STOP_RETRIES {
            if self
                .emitter
                .emit(OutboundEvent::typing(routing.clone(), false))
            {
                if attempt > 0 {
                    debug!("typing stop delivered after {} retries", attempt);
                }
                return;
            }
            if attempt < STOP_RETRIES {
                tokio::time::sleep(STOP_RETRY_DELAY).await;
            }
        }
        // The widget's typing TTL elides the stale indicator.
        error!("failed to publish typing stop after {} retries", STOP_RETRIES);
    }
}
