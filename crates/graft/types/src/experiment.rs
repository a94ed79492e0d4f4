use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An experiment as reported by a tracking server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default)]
    pub experiment_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default)]
    pub lifecycle_stage: String,
    /// Epoch milliseconds; zero when the server never reported one.
    #[serde(default, rename = "creation_time")]
    pub created_time: i64,
    /// Epoch milliseconds of the last server-side mutation.
    #[serde(default, rename = "last_update_time")]
    pub last_updated_time: i64,
    #[serde(default)]
    pub tags: Vec<ExperimentTag>,
}

impl Experiment {
    /// Creation time, `None` when the server reported no usable timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.created_time)
    }

    /// Last-update time, `None` when the server reported no usable timestamp.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.last_updated_time)
    }
}

/// Key/value annotation attached to an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTag {
    pub key: String,
    pub value: String,
}

pub(crate) fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_follow_tracking_dialect() {
        let json = r#"{
            "experiment_id": "7",
            "name": "churn-model",
            "creation_time": 1700000000000,
            "last_update_time": 1700000100000
        }"#;
        let exp: Experiment = serde_json::from_str(json).unwrap();
        assert_eq!(exp.experiment_id, "7");
        assert_eq!(exp.created_time, 1_700_000_000_000);
        assert_eq!(exp.last_updated_time, 1_700_000_100_000);
    }

    #[test]
    fn zero_timestamps_convert_to_none() {
        let exp = Experiment::default();
        assert!(exp.created_at().is_none());
        assert!(exp.updated_at().is_none());
    }
}
