//! Emitter sinks
//!
//! Delivery is fire-and-forget: a bounded channel decouples the pipeline
//! from the transport, and a full buffer drops the event with a warning
//! instead of blocking progress.

use std::sync::Mutex;
use supportflow_core::{EventKind, OutboundEvent, RealtimeEmitter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered sink. The receiver half belongs to the realtime transport.
pub struct BufferedEmitter {
    tx: mpsc::Sender<OutboundEvent>,
}

impl BufferedEmitter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Sink that drains to the log. Used by the worker binary when no
    /// realtime transport is attached.
    pub fn spawn_logging(capacity: usize) -> Self {
        let (emitter, mut rx) = Self::new(capacity);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => debug!(target: "supportflow::events", "{}", json),
                    Err(e) => warn!("failed to serialize realtime event: {}", e),
                }
            }
        });
        emitter
    }
}

impl RealtimeEmitter for BufferedEmitter {
    fn emit(&self, event: OutboundEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("realtime emitter dropped event: {}", e);
                false
            }
        }
    }
}

/// Discards everything. Handy default for contexts without subscribers.
pub struct NullEmitter;

impl RealtimeEmitter for NullEmitter {
    fn emit(&self, _event: OutboundEvent) -> bool {
        true
    }
}

/// Records every event for assertions in tests.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().expect("recording emitter poisoned").clone()
    }

    /// Events matching a predicate on the kind.
    pub fn filtered(&self, predicate: impl Fn(&EventKind) -> bool) -> Vec<OutboundEvent> {
        self.events()
            .into_iter()
            .filter(|e| predicate(&e.kind))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("recording emitter poisoned").clear();
    }
}

impl RealtimeEmitter for RecordingEmitter {
    fn emit(&self, event: OutboundEvent) -> bool {
        self.events
            .lock()
            .expect("recording emitter poisoned")
            .push(event);
        true
    }
}
