use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric readings taken from one data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub unit_id: String,
    pub measurements: BTreeMap<String, f64>,
    pub received_at: DateTime<Utc>,
}

impl TelemetrySample {
    /// Returns a single reading by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }
}

/// Whether water is currently flowing, derived from the latest reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    pub flowing: bool,
    pub updated_at: DateTime<Utc>,
}

impl FlowStatus {
    /// Derives the status from a flow reading.
    pub fn from_reading(value: f64, at: DateTime<Utc>) -> Self {
        Self {
            flowing: value > 0.0,
            updated_at: at,
        }
    }
}
