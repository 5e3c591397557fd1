fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use serde_json::{Value, json};

    use poolflow_protocol::{FrameKind, InboundFrame, OutboundFrame, SubscriptionRequest};
    use poolflow_telemetry::{
        EventSink, FLOW_STATUS_TOPIC, MeasurementPath, TelemetryExtractor, UNIT_DATA_TOPIC,
    };

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_text(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn load_fixture(name: &str) -> Value {
        serde_json::from_str(&load_text(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Parses an outbound fixture, re-encodes it and compares the JSON values.
    fn outbound_roundtrip(name: &str) -> OutboundFrame {
        let fixture = load_fixture(name);
        let frame: OutboundFrame = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            fixture, encoded,
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  ours: {encoded}"
        );
        frame
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, topic: &str, payload: Value) {
            self.events.lock().unwrap().push((topic.to_string(), payload));
        }
    }

    fn waterflow_path() -> MeasurementPath {
        MeasurementPath {
            entity: "unit".into(),
            group: "measurements".into(),
            field: "waterflow".into(),
        }
    }

    // --- Client frames ---

    #[test]
    fn fixture_connection_init() {
        let frame = outbound_roundtrip("connection_init.json");
        assert!(frame.subscription_id().is_none());
    }

    #[test]
    fn fixture_start() {
        let frame = outbound_roundtrip("start.json");
        assert!(frame.is_start());
        assert_eq!(frame.subscription_id(), Some("1"));
    }

    #[test]
    fn fixture_stop() {
        let frame = outbound_roundtrip("stop.json");
        assert_eq!(frame.subscription_id(), Some("1"));
    }

    #[test]
    fn subscription_request_matches_start_fixture() {
        let fixture = load_fixture("start.json");
        let query = fixture["payload"]["query"].as_str().unwrap();
        let request = SubscriptionRequest::new("1", query).with_variable("unitId", "110123456");

        let encoded: Value = serde_json::from_str(&request.start_frame().encode().unwrap()).unwrap();
        assert_eq!(encoded, fixture);

        let stop: Value = serde_json::from_str(&request.stop_frame().encode().unwrap()).unwrap();
        assert_eq!(stop, load_fixture("stop.json"));
    }

    // --- Server frames ---

    #[test]
    fn fixture_connection_ack() {
        let frame = InboundFrame::decode(&load_text("connection_ack.json"));
        assert_eq!(frame.kind, FrameKind::ConnectionAck);
        assert!(frame.id.is_none());
    }

    #[test]
    fn fixture_data() {
        let frame = InboundFrame::decode(&load_text("data.json"));
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.id.as_deref(), Some("1"));
        let unit = frame.entity("unit").unwrap();
        assert_eq!(unit["measurements"]["waterflow"], json!(3.5));
    }

    #[test]
    fn fixture_error() {
        let frame = InboundFrame::decode(&load_text("error.json"));
        assert_eq!(frame.kind, FrameKind::Error);
        assert_eq!(frame.payload["message"], "Unit not found");
    }

    #[test]
    fn fixture_complete() {
        let frame = InboundFrame::decode(&load_text("complete.json"));
        assert_eq!(frame.kind, FrameKind::Complete);
        assert_eq!(frame.id.as_deref(), Some("1"));
    }

    #[test]
    fn fixture_keep_alive_is_unknown() {
        let text = load_text("keep_alive.json");
        let frame = InboundFrame::decode(&text);
        assert_eq!(frame.kind, FrameKind::Unknown);
        assert_eq!(frame.raw.as_deref(), Some(text.as_str()));
    }

    // --- Telemetry over recorded frames ---

    #[test]
    fn data_fixtures_drive_flow_status() {
        let sink = Arc::new(RecordingSink::default());
        let extractor = TelemetryExtractor::new(waterflow_path(), sink.clone());

        let flowing = extractor.on_data_frame(&InboundFrame::decode(&load_text("data.json")));
        assert!(flowing.unwrap().flowing);

        let sample = extractor.latest_sample().unwrap();
        assert_eq!(sample.unit_id, "110123456");
        assert_eq!(sample.get("rx"), Some(712.0));

        let stopped =
            extractor.on_data_frame(&InboundFrame::decode(&load_text("data_no_flow.json")));
        assert!(!stopped.unwrap().flowing);

        let events = sink.events.lock().unwrap();
        let topics: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            [UNIT_DATA_TOPIC, FLOW_STATUS_TOPIC, UNIT_DATA_TOPIC, FLOW_STATUS_TOPIC]
        );
        assert_eq!(events[1].1["flowing"], true);
        assert_eq!(events[3].1["flowing"], false);
    }

    #[test]
    fn non_data_fixtures_leave_flow_unknown() {
        let sink = Arc::new(RecordingSink::default());
        let extractor = TelemetryExtractor::new(waterflow_path(), sink.clone());

        for name in ["connection_ack.json", "error.json", "complete.json", "keep_alive.json"] {
            assert!(extractor.on_data_frame(&InboundFrame::decode(&load_text(name))).is_none());
        }
        assert!(extractor.flow_status().is_none());
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
