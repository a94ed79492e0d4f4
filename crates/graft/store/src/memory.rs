//! In-memory mirror backend.
//!
//! Backs the test suites and small single-process deployments. All state
//! lives in process memory behind `RwLock`ed maps, so it disappears on
//! restart; the pipeline rebuilds it from the tracking servers on the next
//! resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::model::{ExperimentRecord, MetricRecord, NewExperiment, NewMetric, NewRun, RunRecord};
use crate::traits::{ExperimentStore, MetricStore, RunStore};

/// Mirror store keeping every record in process memory.
pub struct MemoryStore {
    experiments: RwLock<HashMap<i64, ExperimentRecord>>,
    runs: RwLock<HashMap<i64, RunRecord>>,
    metrics: RwLock<HashMap<i64, MetricRecord>>,
    next_experiment_id: AtomicI64,
    next_run_id: AtomicI64,
    next_metric_id: AtomicI64,
}

impl MemoryStore {
    /// Creates an empty store. Surrogate ids start at 1.
    pub fn new() -> Self {
        MemoryStore {
            experiments: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            next_experiment_id: AtomicI64::new(1),
            next_run_id: AtomicI64::new(1),
            next_metric_id: AtomicI64::new(1),
        }
    }

    fn read_experiments(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<i64, ExperimentRecord>>> {
        self.experiments
            .read()
            .map_err(|_| StoreError::Backend("experiment lock poisoned".into()))
    }

    fn write_experiments(
        &self,
    ) -> StoreResult<RwLockWriteGuard<'_, HashMap<i64, ExperimentRecord>>> {
        self.experiments
            .write()
            .map_err(|_| StoreError::Backend("experiment lock poisoned".into()))
    }

    fn read_runs(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<i64, RunRecord>>> {
        self.runs
            .read()
            .map_err(|_| StoreError::Backend("run lock poisoned".into()))
    }

    fn write_runs(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<i64, RunRecord>>> {
        self.runs
            .write()
            .map_err(|_| StoreError::Backend("run lock poisoned".into()))
    }

    fn read_metrics(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<i64, MetricRecord>>> {
        self.metrics
            .read()
            .map_err(|_| StoreError::Backend("metric lock poisoned".into()))
    }

    fn write_metrics(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<i64, MetricRecord>>> {
        self.metrics
            .write()
            .map_err(|_| StoreError::Backend("metric lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn create_experiment(&self, experiment: NewExperiment) -> StoreResult<ExperimentRecord> {
        let mut experiments = self.write_experiments()?;
        if experiments
            .values()
            .any(|record| record.experiment_id == experiment.experiment_id)
        {
            return Err(StoreError::Conflict(format!(
                "experiment {}",
                experiment.experiment_id
            )));
        }
        let id = self.next_experiment_id.fetch_add(1, Ordering::Relaxed);
        let record = ExperimentRecord {
            id,
            experiment_id: experiment.experiment_id,
            remote_experiment_id: None,
            name: experiment.name,
            created: experiment.created,
            updated: experiment.updated,
            deleted: false,
            created_ts: experiment.created_ts,
            updated_ts: experiment.updated_ts,
        };
        experiments.insert(id, record.clone());
        Ok(record)
    }

    async fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<ExperimentRecord>> {
        let experiments = self.read_experiments()?;
        Ok(experiments
            .values()
            .find(|record| record.experiment_id == experiment_id)
            .cloned())
    }

    async fn get_experiment_by_id(&self, id: i64) -> StoreResult<Option<ExperimentRecord>> {
        let experiments = self.read_experiments()?;
        Ok(experiments.get(&id).cloned())
    }

    async fn list_experiments(&self) -> StoreResult<Vec<ExperimentRecord>> {
        let experiments = self.read_experiments()?;
        let mut matches: Vec<ExperimentRecord> = experiments
            .values()
            .filter(|record| !record.deleted)
            .cloned()
            .collect();
        matches.sort_unstable_by_key(|record| record.id);
        Ok(matches)
    }

    async fn list_ids_for_run_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>> {
        let experiments = self.read_experiments()?;
        let mut ids: Vec<i64> = experiments
            .values()
            .filter(|record| !record.deleted && (record.created || record.updated))
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(max_items);
        Ok(ids)
    }

    async fn set_remote_experiment_id(
        &self,
        id: i64,
        remote_experiment_id: &str,
    ) -> StoreResult<()> {
        let mut experiments = self.write_experiments()?;
        let record = experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("experiment {id}")))?;
        record.remote_experiment_id = Some(remote_experiment_id.to_string());
        Ok(())
    }

    async fn set_experiment_updated(
        &self,
        id: i64,
        updated: bool,
        updated_ts: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut experiments = self.write_experiments()?;
        let record = experiments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("experiment {id}")))?;
        record.updated = updated;
        record.updated_ts = updated_ts;
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: NewRun) -> StoreResult<RunRecord> {
        let mut runs = self.write_runs()?;
        if runs
            .values()
            .any(|record| record.experiment_id == run.experiment_id && record.run_id == run.run_id)
        {
            return Err(StoreError::Conflict(format!(
                "run {}/{}",
                run.experiment_id, run.run_id
            )));
        }
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let record = RunRecord {
            id,
            experiment_id: run.experiment_id,
            run_id: run.run_id,
            remote_run_id: None,
            created: run.created,
            updated: run.updated,
            deleted: false,
            reconcile_metrics: false,
            created_ts: run.created_ts,
            updated_ts: run.updated_ts,
        };
        runs.insert(id, record.clone());
        Ok(record)
    }

    async fn get_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let runs = self.read_runs()?;
        Ok(runs
            .values()
            .find(|record| record.experiment_id == experiment_id && record.run_id == run_id)
            .cloned())
    }

    async fn get_run_by_id(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        let runs = self.read_runs()?;
        Ok(runs.get(&id).cloned())
    }

    async fn list_runs(&self, experiment_id: &str) -> StoreResult<Vec<RunRecord>> {
        let runs = self.read_runs()?;
        let mut matches: Vec<RunRecord> = runs
            .values()
            .filter(|record| !record.deleted && record.experiment_id == experiment_id)
            .cloned()
            .collect();
        matches.sort_unstable_by_key(|record| record.id);
        Ok(matches)
    }

    async fn list_ids_for_metric_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>> {
        let runs = self.read_runs()?;
        let mut ids: Vec<i64> = runs
            .values()
            .filter(|record| !record.deleted && record.reconcile_metrics)
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(max_items);
        Ok(ids)
    }

    async fn set_remote_run_id(&self, id: i64, remote_run_id: &str) -> StoreResult<()> {
        let mut runs = self.write_runs()?;
        let record = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        record.remote_run_id = Some(remote_run_id.to_string());
        Ok(())
    }

    async fn set_reconcile_metrics(&self, id: i64, reconcile: bool) -> StoreResult<()> {
        let mut runs = self.write_runs()?;
        let record = runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        record.reconcile_metrics = reconcile;
        record.updated_ts = Utc::now();
        Ok(())
    }

    async fn delete_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<()> {
        let mut runs = self.write_runs()?;
        let id = runs
            .values()
            .find(|record| record.experiment_id == experiment_id && record.run_id == run_id)
            .map(|record| record.id);
        if let Some(id) = id {
            runs.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn create_metric(&self, metric: NewMetric) -> StoreResult<MetricRecord> {
        metric.validate()?;
        let mut metrics = self.write_metrics()?;
        if let Some(existing) = metrics.values().find(|record| {
            record.experiment_id == metric.experiment_id
                && record.run_id == metric.run_id
                && record.name == metric.name
                && record.tags == metric.tags
        }) {
            return Ok(existing.clone());
        }
        let id = self.next_metric_id.fetch_add(1, Ordering::Relaxed);
        let record = MetricRecord {
            id,
            experiment_id: metric.experiment_id,
            run_id: metric.run_id,
            name: metric.name,
            kind: metric.kind,
            value_numeric: metric.value_numeric,
            value_text: metric.value_text,
            tags: metric.tags,
            ts: metric.ts,
        };
        metrics.insert(id, record.clone());
        Ok(record)
    }

    async fn get_metric_by_name(
        &self,
        experiment_id: &str,
        run_id: &str,
        name: &str,
    ) -> StoreResult<Option<MetricRecord>> {
        let metrics = self.read_metrics()?;
        Ok(metrics
            .values()
            .filter(|record| {
                record.experiment_id == experiment_id
                    && record.run_id == run_id
                    && record.name == name
            })
            .min_by_key(|record| record.id)
            .cloned())
    }

    async fn list_metrics(
        &self,
        name: Option<&str>,
        experiment_ids: &[String],
        run_ids: &[String],
    ) -> StoreResult<Vec<MetricRecord>> {
        let metrics = self.read_metrics()?;
        let mut matches: Vec<MetricRecord> = metrics
            .values()
            .filter(|record| {
                name.map_or(true, |name| record.name == name)
                    && (experiment_ids.is_empty()
                        || experiment_ids.contains(&record.experiment_id))
                    && (run_ids.is_empty() || run_ids.contains(&record.run_id))
            })
            .cloned()
            .collect();
        matches.sort_unstable_by_key(|record| record.id);
        Ok(matches)
    }

    async fn update_metric(&self, metric: &MetricRecord) -> StoreResult<()> {
        metric.validate()?;
        let mut metrics = self.write_metrics()?;
        let record = metrics
            .get_mut(&metric.id)
            .ok_or_else(|| StoreError::NotFound(format!("metric {}", metric.id)))?;
        *record = metric.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn new_experiment(experiment_id: &str, name: &str) -> NewExperiment {
        let now = Utc::now();
        NewExperiment {
            experiment_id: experiment_id.to_string(),
            name: name.to_string(),
            created: true,
            updated: true,
            created_ts: now,
            updated_ts: now,
        }
    }

    fn new_run(experiment_id: &str, run_id: &str) -> NewRun {
        let now = Utc::now();
        NewRun {
            experiment_id: experiment_id.to_string(),
            run_id: run_id.to_string(),
            created: true,
            updated: true,
            created_ts: now,
            updated_ts: now,
        }
    }

    #[tokio::test]
    async fn experiment_round_trip_and_conflict() {
        let store = MemoryStore::new();
        let record = store
            .create_experiment(new_experiment("exp-1", "demo"))
            .await
            .unwrap();
        assert_eq!(record.id, 1);
        assert!(record.created && record.updated && !record.deleted);
        assert!(!record.has_remote());

        let by_tracking_id = store.get_experiment("exp-1").await.unwrap().unwrap();
        assert_eq!(by_tracking_id, record);
        let by_surrogate = store.get_experiment_by_id(1).await.unwrap().unwrap();
        assert_eq!(by_surrogate, record);
        assert!(store.get_experiment("exp-9").await.unwrap().is_none());
        assert_eq!(store.list_experiments().await.unwrap(), vec![record.clone()]);

        let err = store
            .create_experiment(new_experiment("exp-1", "demo again"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn surrogate_ids_are_monotonic() {
        let store = MemoryStore::new();
        for (n, experiment_id) in ["exp-a", "exp-b", "exp-c"].iter().enumerate() {
            let record = store
                .create_experiment(new_experiment(experiment_id, "demo"))
                .await
                .unwrap();
            assert_eq!(record.id, n as i64 + 1);
        }
    }

    #[tokio::test]
    async fn run_reconciliation_scan_honors_flags_and_limit() {
        let store = MemoryStore::new();
        for experiment_id in ["exp-1", "exp-2", "exp-3"] {
            store
                .create_experiment(new_experiment(experiment_id, "demo"))
                .await
                .unwrap();
        }
        // Clearing `updated` alone keeps the row eligible through `created`.
        store
            .set_experiment_updated(2, false, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.list_ids_for_run_reconciliation(10).await.unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            store.list_ids_for_run_reconciliation(2).await.unwrap(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn run_round_trip_and_delete() {
        let store = MemoryStore::new();
        let record = store.create_run(new_run("exp-1", "run-1")).await.unwrap();
        assert_eq!(record.id, 1);
        assert!(!record.reconcile_metrics);

        let err = store.create_run(new_run("exp-1", "run-1")).await.unwrap_err();
        assert!(err.is_conflict());
        // Same run id under another experiment is a distinct row.
        store.create_run(new_run("exp-2", "run-1")).await.unwrap();

        let fetched = store.get_run("exp-1", "run-1").await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(store.list_runs("exp-1").await.unwrap().len(), 1);

        store.delete_run("exp-1", "run-1").await.unwrap();
        assert!(store.get_run("exp-1", "run-1").await.unwrap().is_none());
        // Deleting an absent run is quiet.
        store.delete_run("exp-1", "run-1").await.unwrap();
    }

    #[tokio::test]
    async fn metric_scan_follows_reconcile_flag() {
        let store = MemoryStore::new();
        store.create_run(new_run("exp-1", "run-1")).await.unwrap();
        store.create_run(new_run("exp-1", "run-2")).await.unwrap();
        assert!(store
            .list_ids_for_metric_reconciliation(10)
            .await
            .unwrap()
            .is_empty());

        store.set_reconcile_metrics(1, true).await.unwrap();
        store.set_reconcile_metrics(2, true).await.unwrap();
        assert_eq!(
            store.list_ids_for_metric_reconciliation(10).await.unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            store.list_ids_for_metric_reconciliation(1).await.unwrap(),
            vec![1]
        );

        store.set_reconcile_metrics(1, false).await.unwrap();
        assert_eq!(
            store.list_ids_for_metric_reconciliation(10).await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn create_metric_dedups_on_full_tag_equality() {
        let store = MemoryStore::new();
        let step_one = BTreeMap::from([("step".to_string(), "1".to_string())]);
        let step_two = BTreeMap::from([("step".to_string(), "2".to_string())]);

        let first = store
            .create_metric(NewMetric::numeric(
                "exp-1",
                "run-1",
                "loss",
                0.9,
                step_one.clone(),
                None,
            ))
            .await
            .unwrap();
        let second = store
            .create_metric(NewMetric::numeric(
                "exp-1", "run-1", "loss", 0.7, step_two, None,
            ))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        // Identical scope, name, and tags: the existing row comes back
        // unchanged, new value discarded.
        let dup = store
            .create_metric(NewMetric::numeric(
                "exp-1", "run-1", "loss", 0.1, step_one, None,
            ))
            .await
            .unwrap();
        assert_eq!(dup.id, first.id);
        assert_eq!(dup.value_numeric, Some(0.9));
    }

    #[tokio::test]
    async fn update_metric_overwrites_in_place() {
        let store = MemoryStore::new();
        let mut record = store
            .create_metric(NewMetric::text("exp-1", "run-1", "notes", "v1", BTreeMap::new()))
            .await
            .unwrap();

        record.value_text = Some("v2".to_string());
        store.update_metric(&record).await.unwrap();
        let fetched = store
            .get_metric_by_name("exp-1", "run-1", "notes")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.value_text.as_deref(), Some("v2"));

        record.id = 99;
        let err = store.update_metric(&record).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_metrics_applies_conjunctive_filters() {
        let store = MemoryStore::new();
        for (run_id, name, value) in [
            ("run-1", "loss", 0.5),
            ("run-1", "accuracy", 0.9),
            ("run-2", "loss", 0.4),
        ] {
            store
                .create_metric(NewMetric::numeric(
                    "exp-1",
                    run_id,
                    name,
                    value,
                    BTreeMap::new(),
                    None,
                ))
                .await
                .unwrap();
        }

        let all = store.list_metrics(None, &[], &[]).await.unwrap();
        assert_eq!(all.len(), 3);

        let losses = store.list_metrics(Some("loss"), &[], &[]).await.unwrap();
        assert_eq!(losses.len(), 2);

        let scoped = store
            .list_metrics(Some("loss"), &["exp-1".to_string()], &["run-2".to_string()])
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].value_numeric, Some(0.4));

        let none = store
            .list_metrics(Some("loss"), &["exp-2".to_string()], &[])
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
