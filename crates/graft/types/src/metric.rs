use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One numeric metric observation logged against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub key: String,
    pub value: f64,
    /// Epoch seconds. The metrics endpoint, unlike the run endpoints, does
    /// not report milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub step: i64,
}

impl MetricSample {
    /// Observation time, `None` when the server reported no usable timestamp.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp <= 0 {
            return None;
        }
        DateTime::from_timestamp(self.timestamp, 0)
    }
}
