//! Record types persisted by the mirror store.
//!
//! Records use `i64` surrogate ids assigned by the backend. The tracking
//! server's own identifiers (`experiment_id`, `run_id`) are stored alongside
//! and are what the sync pipeline keys on when talking to the servers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A mirrored experiment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Surrogate id assigned by the store.
    pub id: i64,
    /// Experiment id on the workspace tracking server.
    pub experiment_id: String,
    /// Experiment id on the platform server, once materialized there.
    pub remote_experiment_id: Option<String>,
    /// Human-readable experiment name.
    pub name: String,
    /// Set when the experiment was inserted; never cleared. Standing
    /// trigger for run discovery under this experiment.
    pub created: bool,
    /// Set when the source experiment changed since the last run pass.
    pub updated: bool,
    /// Soft-delete marker; deleted rows are excluded from scans.
    pub deleted: bool,
    /// Creation time reported by the source server.
    pub created_ts: DateTime<Utc>,
    /// Last source-side update observed.
    pub updated_ts: DateTime<Utc>,
}

impl ExperimentRecord {
    /// True once the experiment has a platform-side counterpart.
    pub fn has_remote(&self) -> bool {
        self.remote_experiment_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

/// A mirrored run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Surrogate id assigned by the store.
    pub id: i64,
    /// Owning experiment's id on the workspace tracking server.
    pub experiment_id: String,
    /// Run id on the workspace tracking server.
    pub run_id: String,
    /// Run id on the platform server, once created there.
    pub remote_run_id: Option<String>,
    /// Set when the run was inserted.
    pub created: bool,
    /// Set when the source run changed since the last pass.
    pub updated: bool,
    /// Soft-delete marker.
    pub deleted: bool,
    /// Set when the run's metrics and artifacts still need a sweep.
    pub reconcile_metrics: bool,
    /// Creation time reported by the source server.
    pub created_ts: DateTime<Utc>,
    /// Last source-side update observed.
    pub updated_ts: DateTime<Utc>,
}

impl RunRecord {
    /// True once the run has a platform-side counterpart.
    pub fn has_remote(&self) -> bool {
        self.remote_run_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Distinguishes scalar series samples from text values (logged files).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A numeric sample with an optional observation timestamp.
    Numeric,
    /// A text value captured from a run artifact.
    Text,
}

impl MetricKind {
    /// Stable string form used by relational backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Numeric => "numeric",
            MetricKind::Text => "text",
        }
    }

    /// Parses the stable string form back into a kind.
    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "numeric" => Ok(MetricKind::Numeric),
            "text" => Ok(MetricKind::Text),
            other => Err(StoreError::InvalidInput(format!(
                "unknown metric kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that a metric payload matches its declared kind.
pub(crate) fn check_metric_payload(
    name: &str,
    kind: MetricKind,
    value_numeric: Option<f64>,
    value_text: Option<&str>,
) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidInput("metric name is empty".into()));
    }
    match kind {
        MetricKind::Numeric => {
            if value_numeric.is_none() || value_text.is_some() {
                return Err(StoreError::InvalidInput(
                    "numeric metric requires a numeric value and no text value".into(),
                ));
            }
        }
        MetricKind::Text => {
            if value_text.is_none() || value_numeric.is_some() {
                return Err(StoreError::InvalidInput(
                    "text metric requires a text value and no numeric value".into(),
                ));
            }
        }
    }
    Ok(())
}

/// A mirrored metric row, scoped to one run.
///
/// Exactly one of `value_numeric` and `value_text` is populated, matching
/// `kind`. Tags disambiguate samples that share a name, e.g. the step
/// counter of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Surrogate id assigned by the store.
    pub id: i64,
    /// Owning experiment's id on the workspace tracking server.
    pub experiment_id: String,
    /// Owning run's id on the workspace tracking server.
    pub run_id: String,
    /// Metric name.
    pub name: String,
    /// Payload discriminator.
    pub kind: MetricKind,
    /// Numeric payload, present iff `kind` is [`MetricKind::Numeric`].
    pub value_numeric: Option<f64>,
    /// Text payload, present iff `kind` is [`MetricKind::Text`].
    pub value_text: Option<String>,
    /// Free-form tags; ordered so equality is stable.
    pub tags: BTreeMap<String, String>,
    /// Observation time of the newest sample folded into this row.
    pub ts: Option<DateTime<Utc>>,
}

impl MetricRecord {
    /// Checks that the payload matches the declared kind.
    pub(crate) fn validate(&self) -> StoreResult<()> {
        check_metric_payload(
            &self.name,
            self.kind,
            self.value_numeric,
            self.value_text.as_deref(),
        )
    }
}

/// Insert payload for [`crate::traits::ExperimentStore::create_experiment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    /// Experiment id on the workspace tracking server.
    pub experiment_id: String,
    /// Human-readable experiment name.
    pub name: String,
    /// Initial `created` flag.
    pub created: bool,
    /// Initial `updated` flag.
    pub updated: bool,
    /// Creation time reported by the source server.
    pub created_ts: DateTime<Utc>,
    /// Last source-side update observed.
    pub updated_ts: DateTime<Utc>,
}

/// Insert payload for [`crate::traits::RunStore::create_run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    /// Owning experiment's id on the workspace tracking server.
    pub experiment_id: String,
    /// Run id on the workspace tracking server.
    pub run_id: String,
    /// Initial `created` flag.
    pub created: bool,
    /// Initial `updated` flag.
    pub updated: bool,
    /// Creation time reported by the source server.
    pub created_ts: DateTime<Utc>,
    /// Last source-side update observed.
    pub updated_ts: DateTime<Utc>,
}

/// Insert payload for [`crate::traits::MetricStore::create_metric`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMetric {
    /// Owning experiment's id on the workspace tracking server.
    pub experiment_id: String,
    /// Owning run's id on the workspace tracking server.
    pub run_id: String,
    /// Metric name.
    pub name: String,
    /// Payload discriminator.
    pub kind: MetricKind,
    /// Numeric payload, present iff `kind` is [`MetricKind::Numeric`].
    pub value_numeric: Option<f64>,
    /// Text payload, present iff `kind` is [`MetricKind::Text`].
    pub value_text: Option<String>,
    /// Free-form tags.
    pub tags: BTreeMap<String, String>,
    /// Observation time, if the source reported one.
    pub ts: Option<DateTime<Utc>>,
}

impl NewMetric {
    /// Builds a numeric metric payload.
    pub fn numeric(
        experiment_id: impl Into<String>,
        run_id: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        tags: BTreeMap<String, String>,
        ts: Option<DateTime<Utc>>,
    ) -> Self {
        NewMetric {
            experiment_id: experiment_id.into(),
            run_id: run_id.into(),
            name: name.into(),
            kind: MetricKind::Numeric,
            value_numeric: Some(value),
            value_text: None,
            tags,
            ts,
        }
    }

    /// Builds a text metric payload.
    pub fn text(
        experiment_id: impl Into<String>,
        run_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        NewMetric {
            experiment_id: experiment_id.into(),
            run_id: run_id.into(),
            name: name.into(),
            kind: MetricKind::Text,
            value_numeric: None,
            value_text: Some(value.into()),
            tags,
            ts: None,
        }
    }

    /// Checks that the payload matches the declared kind.
    pub(crate) fn validate(&self) -> StoreResult<()> {
        check_metric_payload(
            &self.name,
            self.kind,
            self.value_numeric,
            self.value_text.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kind_round_trips_through_strings() {
        for kind in [MetricKind::Numeric, MetricKind::Text] {
            assert_eq!(MetricKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(MetricKind::parse("histogram").is_err());
    }

    #[test]
    fn numeric_constructor_produces_valid_payload() {
        let metric = NewMetric::numeric("exp-1", "run-1", "loss", 0.42, BTreeMap::new(), None);
        assert_eq!(metric.kind, MetricKind::Numeric);
        metric.validate().unwrap();
    }

    #[test]
    fn validate_rejects_mismatched_payloads() {
        let mut metric = NewMetric::text("exp-1", "run-1", "notes", "hello", BTreeMap::new());
        metric.value_numeric = Some(1.0);
        assert!(metric.validate().is_err());

        let mut metric = NewMetric::numeric("exp-1", "run-1", "loss", 1.0, BTreeMap::new(), None);
        metric.value_numeric = None;
        assert!(metric.validate().is_err());
    }

    #[test]
    fn has_remote_ignores_empty_ids() {
        let now = Utc::now();
        let mut record = ExperimentRecord {
            id: 1,
            experiment_id: "exp-1".into(),
            remote_experiment_id: None,
            name: "demo".into(),
            created: true,
            updated: true,
            deleted: false,
            created_ts: now,
            updated_ts: now,
        };
        assert!(!record.has_remote());
        record.remote_experiment_id = Some(String::new());
        assert!(!record.has_remote());
        record.remote_experiment_id = Some("43".into());
        assert!(record.has_remote());
    }
}
