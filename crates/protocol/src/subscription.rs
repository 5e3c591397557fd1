use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::{OutboundFrame, StartPayload};

/// The single logical subscription a client keeps alive.
///
/// The `id` stays the same for the lifetime of the subscription, including
/// across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl SubscriptionRequest {
    /// Creates a request without variables.
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            variables: Map::new(),
        }
    }

    /// Adds a query variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Builds the `start` frame for this request.
    pub fn start_frame(&self) -> OutboundFrame {
        OutboundFrame::Start {
            id: self.id.clone(),
            payload: StartPayload {
                query: self.query.clone(),
                variables: self.variables.clone(),
            },
        }
    }

    /// Builds the `stop` frame for this request.
    pub fn stop_frame(&self) -> OutboundFrame {
        OutboundFrame::Stop {
            id: self.id.clone(),
        }
    }
}
