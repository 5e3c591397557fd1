//! Bookkeeping for the single subscription a client keeps alive.

use serde_json::Value;
use tracing::{debug, trace};

use poolflow_protocol::{FrameKind, InboundFrame, OutboundFrame, SubscriptionRequest};

/// Where an inbound frame should go after routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Handshake acknowledgement, handled by the connection state machine.
    Ack,
    /// Subscription data for the extractor.
    Data,
    /// Server-reported subscription error.
    Error { id: Option<String>, payload: Value },
    /// The server ended the subscription.
    Completed { id: String },
    /// Stale, unknown or unexpected frame.
    Dropped,
}

/// Tracks the registered request and whether it is active on the current
/// connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    request: Option<SubscriptionRequest>,
    active: bool,
    started_generation: Option<u64>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with `request` already registered.
    pub fn with_request(request: SubscriptionRequest) -> Self {
        Self {
            request: Some(request),
            ..Self::default()
        }
    }

    /// Stores `request` as the subscription to start on the next ready
    /// connection.
    ///
    /// Returns a `stop` frame for the previously active request, if any.
    pub fn register(&mut self, request: SubscriptionRequest) -> Option<OutboundFrame> {
        let stop = self.stop_frame();
        debug!(id = %request.id, "subscription registered");
        self.request = Some(request);
        self.active = false;
        self.started_generation = None;
        stop
    }

    /// Currently registered request.
    pub fn request(&self) -> Option<&SubscriptionRequest> {
        self.request.as_ref()
    }

    /// Returns `true` while a started subscription has not been completed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Called when connection `generation` becomes ready.
    ///
    /// Yields the `start` frame at most once per generation.
    pub fn on_ready(&mut self, generation: u64) -> Option<OutboundFrame> {
        if self.started_generation == Some(generation) {
            trace!(generation, "subscription already started on this connection");
            return None;
        }
        let request = self.request.as_ref()?;
        self.started_generation = Some(generation);
        self.active = true;
        debug!(id = %request.id, generation, "starting subscription");
        Some(request.start_frame())
    }

    /// Classifies an inbound frame against the registered subscription.
    pub fn on_frame(&mut self, frame: &InboundFrame) -> Routed {
        if let (Some(id), Some(request)) = (frame.id.as_deref(), self.request.as_ref()) {
            if id != request.id {
                debug!(id, expected = %request.id, "frame for another subscription dropped");
                return Routed::Dropped;
            }
        }

        match frame.kind {
            FrameKind::ConnectionAck => Routed::Ack,
            FrameKind::Data if self.active => Routed::Data,
            FrameKind::Data => {
                debug!("data frame for inactive subscription dropped");
                Routed::Dropped
            }
            FrameKind::Error => Routed::Error {
                id: frame.id.clone(),
                payload: frame.payload.clone(),
            },
            FrameKind::Complete => {
                let Some(request) = self.request.as_ref() else {
                    return Routed::Dropped;
                };
                self.active = false;
                debug!(id = %request.id, "subscription completed by server");
                Routed::Completed {
                    id: request.id.clone(),
                }
            }
            FrameKind::Unknown => {
                debug!(raw = frame.raw.as_deref().unwrap_or(""), "unknown frame dropped");
                Routed::Dropped
            }
        }
    }

    /// `stop` frame for the active subscription, if one is running.
    pub fn stop_frame(&self) -> Option<OutboundFrame> {
        if !self.active {
            return None;
        }
        self.request.as_ref().map(SubscriptionRequest::stop_frame)
    }

    /// Forgets per-connection state. The registered request is kept.
    pub fn on_connection_lost(&mut self) {
        self.active = false;
        self.started_generation = None;
    }
}
