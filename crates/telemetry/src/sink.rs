//! Outward delivery of derived state.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Topic carrying serialized [`FlowStatus`](crate::FlowStatus) changes.
pub const FLOW_STATUS_TOPIC: &str = "/topic/status";

/// Topic carrying the full decoded unit entity of every data frame.
pub const UNIT_DATA_TOPIC: &str = "/topic/poolData";

/// Receives published events for delivery to downstream consumers.
///
/// Implementations must not block: the connection driver calls `publish`
/// inline while processing frames.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEvent {
    pub topic: String,
    pub payload: Value,
}

/// Fans events out to any number of subscribers over a broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; the publisher never
/// waits for them.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SinkEvent>,
}

impl BroadcastSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, topic: &str, payload: Value) {
        let event = SinkEvent {
            topic: topic.to_string(),
            payload,
        };
        if self.tx.send(event).is_err() {
            trace!(topic, "no subscribers, event dropped");
        }
    }
}
