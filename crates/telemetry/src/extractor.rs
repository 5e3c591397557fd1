//! Maps subscription data frames to samples and flow status.
//!
//! The extractor walks `payload.data.<entity>.<group>.<field>` of each data
//! frame. Any missing step leaves the previous [`FlowStatus`] untouched.
//! Status changes are edge-triggered: the sink only hears about a reading
//! when it flips `flowing`, while the decoded entity is forwarded on every
//! frame.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use poolflow_protocol::{FrameKind, InboundFrame};

use crate::sample::{FlowStatus, TelemetrySample};
use crate::sink::{EventSink, FLOW_STATUS_TOPIC, UNIT_DATA_TOPIC};

/// Location of the flow reading inside a data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementPath {
    /// Key of the entity under `payload.data` (e.g. `"unit"`).
    pub entity: String,
    /// Object under the entity holding numeric readings.
    pub group: String,
    /// Reading that drives the flow status.
    pub field: String,
}

impl Default for MeasurementPath {
    fn default() -> Self {
        Self {
            entity: "unit".into(),
            group: "measurements".into(),
            field: "waterflow".into(),
        }
    }
}

/// Single-writer holder of the latest sample and flow status.
pub struct TelemetryExtractor {
    path: MeasurementPath,
    default_unit_id: String,
    sink: Arc<dyn EventSink>,
    flow_tx: watch::Sender<Option<FlowStatus>>,
    sample_tx: watch::Sender<Option<TelemetrySample>>,
}

impl TelemetryExtractor {
    /// Creates an extractor publishing to `sink`.
    pub fn new(path: MeasurementPath, sink: Arc<dyn EventSink>) -> Self {
        let (flow_tx, _) = watch::channel(None);
        let (sample_tx, _) = watch::channel(None);
        Self {
            path,
            default_unit_id: String::new(),
            sink,
            flow_tx,
            sample_tx,
        }
    }

    /// Unit id recorded on samples whose entity carries no `id`.
    pub fn with_unit_id(mut self, unit_id: impl Into<String>) -> Self {
        self.default_unit_id = unit_id.into();
        self
    }

    /// Processes one data frame.
    ///
    /// Returns the new status when this frame changed `flowing`.
    pub fn on_data_frame(&self, frame: &InboundFrame) -> Option<FlowStatus> {
        if frame.kind != FrameKind::Data {
            return None;
        }
        let Some(entity) = frame.entity(&self.path.entity) else {
            debug!(entity = %self.path.entity, "data frame without entity, ignored");
            return None;
        };
        self.sink.publish(UNIT_DATA_TOPIC, entity.clone());

        let Some(group) = entity.get(&self.path.group).and_then(Value::as_object) else {
            trace!(group = %self.path.group, "entity without measurements");
            return None;
        };

        let now = Utc::now();
        let measurements: BTreeMap<String, f64> = group
            .iter()
            .filter_map(|(name, value)| value.as_f64().map(|n| (name.clone(), n)))
            .collect();
        let unit_id = entity
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_unit_id.clone());
        self.sample_tx.send_replace(Some(TelemetrySample {
            unit_id,
            measurements,
            received_at: now,
        }));

        let Some(reading) = group.get(&self.path.field).and_then(Value::as_f64) else {
            trace!(field = %self.path.field, "flow reading missing or not numeric");
            return None;
        };
        self.apply_reading(reading, now)
    }

    fn apply_reading(&self, reading: f64, at: DateTime<Utc>) -> Option<FlowStatus> {
        let next = FlowStatus::from_reading(reading, at);
        let previous = self.flow_tx.send_replace(Some(next));
        if previous.map(|p| p.flowing) == Some(next.flowing) {
            trace!(reading, flowing = next.flowing, "flow status unchanged");
            return None;
        }

        info!(reading, flowing = next.flowing, "flow status changed");
        match serde_json::to_value(next) {
            Ok(payload) => self.sink.publish(FLOW_STATUS_TOPIC, payload),
            Err(e) => warn!(error = %e, "failed to serialize flow status"),
        }
        Some(next)
    }

    /// Latest flow status, `None` until the first valid reading.
    pub fn flow_status(&self) -> Option<FlowStatus> {
        *self.flow_tx.borrow()
    }

    /// Subscribes to flow status updates.
    pub fn watch_flow(&self) -> watch::Receiver<Option<FlowStatus>> {
        self.flow_tx.subscribe()
    }

    /// Latest sample, if any data frame carried measurements.
    pub fn latest_sample(&self) -> Option<TelemetrySample> {
        self.sample_tx.borrow().clone()
    }
}
