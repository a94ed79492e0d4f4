//! Stage 3: folding platform metrics and artifacts into the mirror.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use graft_reconcile::{BoxError, ReconcileItem, ReconcileQueue, Reconciler};
use graft_store::{MetricKind, MirrorStore, NewMetric, RunRecord};
use graft_tracking::TrackingPair;
use graft_types::MetricSample;
use tracing::debug;

/// Sweeps flagged runs, writing the platform's metric state into the
/// mirror.
///
/// Keys are mirror-row surrogate ids of runs. Numeric samples fold into
/// one row per metric name holding the newest observation; `.json`
/// artifacts fold into text rows named after the file. Metric rows are
/// keyed by the local server's ids so they join against the experiment and
/// run mirror rows.
pub struct MetricsReconciler {
    store: Arc<dyn MirrorStore>,
    tracking: TrackingPair,
    resync_max_items: usize,
}

impl MetricsReconciler {
    pub fn new(store: Arc<dyn MirrorStore>, tracking: TrackingPair, resync_max_items: usize) -> Self {
        MetricsReconciler {
            store,
            tracking,
            resync_max_items,
        }
    }

    async fn reconcile_one(&self, id: i64) -> Result<(), BoxError> {
        let row = match self.store.get_run_by_id(id).await? {
            Some(row) => row,
            None => {
                debug!(id, "run row vanished, dropping");
                return Ok(());
            }
        };
        if row.deleted {
            return Ok(());
        }
        let remote_run_id = match row.remote_run_id.as_deref() {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            _ => {
                // The run stage has not created the platform run yet. The
                // flag stays set, so this run comes back next scan.
                debug!(id, run_id = %row.run_id, "run not on the platform yet, skipping");
                return Ok(());
            }
        };
        let experiment = match self.store.get_experiment(&row.experiment_id).await? {
            Some(experiment) => experiment,
            None => {
                debug!(id, experiment_id = %row.experiment_id, "owning experiment row missing, skipping");
                return Ok(());
            }
        };
        let remote_experiment_id = match experiment.remote_experiment_id.as_deref() {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            _ => {
                debug!(id, "owning experiment not on the platform yet, skipping");
                return Ok(());
            }
        };

        let samples = self
            .tracking
            .remote
            .metrics(&remote_experiment_id, &remote_run_id)
            .await?;
        for sample in &samples {
            self.fold_sample(&row, sample).await?;
        }

        let files = self.tracking.remote.artifacts(&remote_run_id, None).await?;
        let mut folded_files = 0usize;
        for file in &files {
            if file.is_dir || !file.path.ends_with(".json") {
                continue;
            }
            let bytes = self.tracking.remote.get_artifact(&remote_run_id, &file.path).await?;
            let value = String::from_utf8_lossy(&bytes).into_owned();
            self.fold_text(&row, file.file_name(), value).await?;
            folded_files += 1;
        }

        self.store.set_reconcile_metrics(row.id, false).await?;
        debug!(
            run_id = %row.run_id,
            samples = samples.len(),
            files = folded_files,
            "metric sweep complete"
        );
        Ok(())
    }

    /// Numeric upsert: a sample only replaces the stored row when the row
    /// never recorded a timestamp or the sample is strictly newer.
    async fn fold_sample(&self, row: &RunRecord, sample: &MetricSample) -> Result<(), BoxError> {
        if sample.key.is_empty() {
            return Ok(());
        }
        let tags = BTreeMap::from([("step".to_string(), sample.step.to_string())]);
        match self
            .store
            .get_metric_by_name(&row.experiment_id, &row.run_id, &sample.key)
            .await?
        {
            None => {
                self.store
                    .create_metric(NewMetric::numeric(
                        row.experiment_id.clone(),
                        row.run_id.clone(),
                        sample.key.clone(),
                        sample.value,
                        tags,
                        sample.recorded_at(),
                    ))
                    .await?;
            }
            Some(mut existing) => {
                let incoming = sample.recorded_at();
                let newer = match (existing.ts, incoming) {
                    (None, _) => true,
                    (Some(stored), Some(at)) => at > stored,
                    (Some(_), None) => false,
                };
                if newer {
                    existing.kind = MetricKind::Numeric;
                    existing.value_numeric = Some(sample.value);
                    existing.value_text = None;
                    existing.tags = tags;
                    existing.ts = incoming.or(existing.ts);
                    self.store.update_metric(&existing).await?;
                }
            }
        }
        Ok(())
    }

    /// Text upsert: rewrite only when the stored value actually differs.
    async fn fold_text(&self, row: &RunRecord, name: &str, value: String) -> Result<(), BoxError> {
        match self
            .store
            .get_metric_by_name(&row.experiment_id, &row.run_id, name)
            .await?
        {
            None => {
                self.store
                    .create_metric(NewMetric::text(
                        row.experiment_id.clone(),
                        row.run_id.clone(),
                        name,
                        value,
                        BTreeMap::new(),
                    ))
                    .await?;
            }
            Some(mut existing) => {
                if existing.value_text.as_deref() != Some(value.as_str()) {
                    existing.kind = MetricKind::Text;
                    existing.value_text = Some(value);
                    existing.value_numeric = None;
                    self.store.update_metric(&existing).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler<i64> for MetricsReconciler {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn reboot(&self) -> Result<(), BoxError> {
        // Flags live in the mirror store; the first scan picks them up.
        Ok(())
    }

    async fn resync(&self, queue: &ReconcileQueue<i64>) -> Result<(), BoxError> {
        let ids = self
            .store
            .list_ids_for_metric_reconciliation(self.resync_max_items)
            .await?;
        for id in ids {
            queue.add(id);
        }
        Ok(())
    }

    async fn reconcile(&self, items: Vec<ReconcileItem<i64>>) -> Result<(), BoxError> {
        for item in items {
            let id = *item.key();
            match self.reconcile_one(id).await {
                Ok(()) => item.complete(),
                Err(error) => item.fail(error),
            }
        }
        Ok(())
    }
}
