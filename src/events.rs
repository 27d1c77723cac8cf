//! Event emission.
//!
//! The original inherits `Queue` from an event-emitter base; this crate
//! prefers composition instead: a queue or worker owns a pluggable sink and
//! forwards named events with typed payloads, rather than being one itself.

use tokio::sync::broadcast;

/// One lifecycle notification a queue or worker forwards to its sink.
#[derive(Debug, Clone)]
pub enum Event {
    Added { job_id: String, name: String },
    Active { job_id: String },
    Completed { job_id: String, returnvalue: serde_json::Value },
    Failed { job_id: String, failed_reason: String },
    Progress { job_id: String, data: serde_json::Value },
    Stalled { job_id: String },
    Paused,
    Resumed,
    Closed,
    Error { message: String },
}

/// A sink events are forwarded to. The default is a broadcast channel;
/// callers wanting custom routing (metrics, webhooks) implement this
/// directly instead of subclassing anything.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Broadcast-channel backed sink. Emitting with no subscriber is a no-op,
/// matching the fire-and-forget semantics of the original's event emitter.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Sink that drops every event; the default for producers/workers that
/// never attached a subscriber.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();
        sink.emit(Event::Paused);
        assert!(matches!(rx.recv().await.unwrap(), Event::Paused));
    }

    #[test]
    fn emit_with_no_subscriber_does_not_panic() {
        let sink = BroadcastEventSink::default();
        sink.emit(Event::Closed);
    }

    #[test]
    fn null_sink_drops_silently() {
        let sink = NullEventSink;
        sink.emit(Event::Resumed);
    }
}
