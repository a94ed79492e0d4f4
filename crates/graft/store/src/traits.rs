//! Store traits implemented by every mirror backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::model::{ExperimentRecord, MetricRecord, NewExperiment, NewMetric, NewRun, RunRecord};

/// Persistence operations for mirrored experiments.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Inserts a new experiment row.
    ///
    /// The row starts with both `created` and `updated` taken from the
    /// payload and a backend-assigned surrogate id. Returns
    /// [`crate::StoreError::Conflict`] when the tracking-server id is
    /// already mirrored.
    async fn create_experiment(&self, experiment: NewExperiment) -> StoreResult<ExperimentRecord>;

    /// Looks up an experiment by its tracking-server id.
    async fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<ExperimentRecord>>;

    /// Looks up an experiment by its surrogate id.
    async fn get_experiment_by_id(&self, id: i64) -> StoreResult<Option<ExperimentRecord>>;

    /// All live experiment rows, ordered by surrogate id.
    async fn list_experiments(&self) -> StoreResult<Vec<ExperimentRecord>>;

    /// Surrogate ids of experiments whose runs need a pass, bounded by
    /// `max_items`.
    ///
    /// An experiment qualifies while either reconciliation flag is set and
    /// the row is not deleted. `created` stays set for the row's lifetime,
    /// so every scan keeps revisiting live experiments for new runs.
    async fn list_ids_for_run_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>>;

    /// Records the platform-side id materialized for an experiment.
    async fn set_remote_experiment_id(
        &self,
        id: i64,
        remote_experiment_id: &str,
    ) -> StoreResult<()>;

    /// Sets the `updated` flag and the observed source update time.
    async fn set_experiment_updated(
        &self,
        id: i64,
        updated: bool,
        updated_ts: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Persistence operations for mirrored runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run row.
    ///
    /// Returns [`crate::StoreError::Conflict`] when the (experiment, run)
    /// pair is already mirrored.
    async fn create_run(&self, run: NewRun) -> StoreResult<RunRecord>;

    /// Looks up a run by its tracking-server ids.
    async fn get_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<Option<RunRecord>>;

    /// Looks up a run by its surrogate id.
    async fn get_run_by_id(&self, id: i64) -> StoreResult<Option<RunRecord>>;

    /// All live runs mirrored under an experiment.
    async fn list_runs(&self, experiment_id: &str) -> StoreResult<Vec<RunRecord>>;

    /// Surrogate ids of runs whose metrics need a sweep, bounded by
    /// `max_items`. Only live runs with `reconcile_metrics` set qualify.
    async fn list_ids_for_metric_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>>;

    /// Records the platform-side id created for a run.
    async fn set_remote_run_id(&self, id: i64, remote_run_id: &str) -> StoreResult<()>;

    /// Sets the `reconcile_metrics` flag. Also bumps the row's `updated_ts`
    /// so the write is visible to observers.
    async fn set_reconcile_metrics(&self, id: i64, reconcile: bool) -> StoreResult<()>;

    /// Removes a run row by its tracking-server ids.
    ///
    /// Deleting a run that is not mirrored is not an error. Metric rows
    /// under the run are left in place.
    async fn delete_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<()>;
}

/// Persistence operations for mirrored metrics.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Inserts a new metric row.
    ///
    /// When a row with the same run scope, name, and tag set already
    /// exists, the existing row is returned unchanged instead of creating
    /// a duplicate.
    async fn create_metric(&self, metric: NewMetric) -> StoreResult<MetricRecord>;

    /// Looks up a metric by name within a run. When several rows share the
    /// name the one with the lowest surrogate id is returned; callers that
    /// need a specific sample filter with [`MetricStore::list_metrics`].
    async fn get_metric_by_name(
        &self,
        experiment_id: &str,
        run_id: &str,
        name: &str,
    ) -> StoreResult<Option<MetricRecord>>;

    /// Metrics matching the given filters. Filters are conjunctive; an
    /// empty id slice leaves that dimension unconstrained.
    async fn list_metrics(
        &self,
        name: Option<&str>,
        experiment_ids: &[String],
        run_ids: &[String],
    ) -> StoreResult<Vec<MetricRecord>>;

    /// Overwrites a metric row in place, addressed by its surrogate id.
    async fn update_metric(&self, metric: &MetricRecord) -> StoreResult<()>;
}

/// Full mirror surface the sync pipeline runs against.
pub trait MirrorStore: ExperimentStore + RunStore + MetricStore {}

impl<T> MirrorStore for T where T: ExperimentStore + RunStore + MetricStore {}
