pub mod extractor;
pub mod sample;
pub mod sink;

pub use extractor::{MeasurementPath, TelemetryExtractor};
pub use sample::{FlowStatus, TelemetrySample};
pub use sink::{BroadcastSink, EventSink, FLOW_STATUS_TOPIC, SinkEvent, UNIT_DATA_TOPIC};
