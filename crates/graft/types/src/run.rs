use crate::artifact::Artifact;
use crate::experiment::millis_to_utc;
use crate::metric::MetricSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A run with its identifying info and logged data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub data: RunData,
}

/// Identifying and lifecycle fields of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub run_id: String,
    #[serde(default, rename = "run_name")]
    pub name: String,
    #[serde(default)]
    pub experiment_id: String,
    #[serde(default)]
    pub status: RunStatus,
    /// Epoch milliseconds.
    #[serde(default)]
    pub start_time: i64,
    /// Epoch milliseconds; zero while the run is still open.
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub artifact_uri: String,
    #[serde(default)]
    pub lifecycle_stage: String,
}

impl RunInfo {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.start_time)
    }

    /// End time, `None` while the run has not finished.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.end_time)
    }
}

/// Execution state reported by the tracking server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Everything logged against a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
    #[serde(default)]
    pub params: Vec<RunParam>,
    #[serde(default)]
    pub tags: Vec<RunTag>,
    #[serde(default)]
    pub files: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParam {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTag {
    pub key: String,
    pub value: String,
}
