//! Stage 2: run propagation to the platform.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use graft_reconcile::{BoxError, ReconcileItem, ReconcileQueue, Reconciler};
use graft_store::{ExperimentRecord, MirrorStore, NewRun};
use graft_tracking::TrackingPair;
use graft_types::{Run, RunStatus};
use tracing::{debug, info, warn};

/// Pushes the runs of flagged experiments to the platform.
///
/// Keys are mirror-row surrogate ids of experiments. A pass walks every run
/// the local server knows under the experiment, creates missing platform
/// runs, pushes drifted state, and flags runs for the metric stage. At the
/// end it clears the experiment's `updated` flag only; `created` stays set
/// so later runs under a quiet experiment are still found.
pub struct RunReconciler {
    store: Arc<dyn MirrorStore>,
    tracking: TrackingPair,
    resync_max_items: usize,
}

impl RunReconciler {
    pub fn new(store: Arc<dyn MirrorStore>, tracking: TrackingPair, resync_max_items: usize) -> Self {
        RunReconciler {
            store,
            tracking,
            resync_max_items,
        }
    }

    async fn reconcile_one(&self, id: i64) -> Result<(), BoxError> {
        let experiment = match self.store.get_experiment_by_id(id).await? {
            Some(record) => record,
            None => {
                debug!(id, "experiment row vanished, dropping");
                return Ok(());
            }
        };
        if experiment.deleted {
            return Ok(());
        }
        if experiment.experiment_id.is_empty() || experiment.experiment_id == "0" {
            debug!(id, "experiment row has no usable tracking id, skipping");
            return Ok(());
        }
        let remote_experiment_id = match experiment.remote_experiment_id.as_deref() {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            _ => {
                debug!(
                    id,
                    experiment_id = %experiment.experiment_id,
                    "experiment not on the platform yet, skipping"
                );
                return Ok(());
            }
        };

        let runs = self
            .tracking
            .local
            .list_runs(&experiment.experiment_id)
            .await?;
        for run in &runs {
            self.reconcile_run(&experiment, &remote_experiment_id, run).await?;
        }

        // Clear `updated` only; the standing `created` flag keeps this
        // experiment in future scans for runs that do not exist yet.
        self.store
            .set_experiment_updated(experiment.id, false, experiment.updated_ts)
            .await?;
        Ok(())
    }

    async fn reconcile_run(
        &self,
        experiment: &ExperimentRecord,
        remote_experiment_id: &str,
        run: &Run,
    ) -> Result<(), BoxError> {
        let run_id = run.info.run_id.as_str();
        if run_id.is_empty() {
            debug!(
                experiment_id = %experiment.experiment_id,
                "run without an id in listing, skipping"
            );
            return Ok(());
        }

        let mut changed = false;
        let row = match self.store.get_run(&experiment.experiment_id, run_id).await? {
            Some(row) => row,
            None => {
                let now = Utc::now();
                let row = self
                    .store
                    .create_run(NewRun {
                        experiment_id: experiment.experiment_id.clone(),
                        run_id: run_id.to_string(),
                        created: true,
                        updated: true,
                        created_ts: run.info.started_at().unwrap_or(now),
                        updated_ts: now,
                    })
                    .await?;
                info!(experiment_id = %experiment.experiment_id, run_id, "mirrored new run");
                changed = true;
                row
            }
        };
        if row.deleted {
            return Ok(());
        }

        let remote_run_id = match row.remote_run_id.as_deref() {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            _ => {
                let started = run.info.started_at().unwrap_or_else(Utc::now);
                let remote_run_id = self
                    .tracking
                    .remote
                    .create_run(remote_experiment_id, &run.info.name, started, &run.data.tags)
                    .await?;
                self.store.set_remote_run_id(row.id, &remote_run_id).await?;
                info!(run_id, remote_run_id = %remote_run_id, "created run on the platform");
                changed = true;
                remote_run_id
            }
        };

        let remote_run = match self.tracking.remote.get_run(&remote_run_id).await? {
            Some(remote) => remote,
            None => {
                // Not visible yet on the eventually-consistent platform;
                // the standing `created` flag brings us back next scan.
                warn!(run_id, remote_run_id = %remote_run_id, "run not visible on the platform yet");
                return Ok(());
            }
        };

        if run_differs(run, &remote_run) {
            let mut desired = run.clone();
            desired.info.run_id = remote_run_id.clone();
            desired.info.experiment_id = remote_experiment_id.to_string();
            let pushed = self.tracking.remote.update_run(&desired).await?;
            verify_run_update(&desired, &pushed);
            debug!(run_id, remote_run_id = %remote_run_id, "pushed run state to the platform");
            changed = true;
        }

        // Live runs keep producing samples, so they stay flagged for the
        // metric stage even on a quiet pass.
        if changed || run.info.status == RunStatus::Running {
            self.store.set_reconcile_metrics(row.id, true).await?;
        }
        Ok(())
    }
}

/// True when the platform's view lags the local run. Extra data on the
/// platform side never counts as drift; only local state the platform is
/// missing does.
fn run_differs(local: &Run, remote: &Run) -> bool {
    if local.info.name != remote.info.name
        || local.info.status != remote.info.status
        || local.info.end_time != remote.info.end_time
    {
        return true;
    }
    if !local.info.lifecycle_stage.is_empty()
        && local.info.lifecycle_stage != remote.info.lifecycle_stage
    {
        return true;
    }
    for param in &local.data.params {
        if !remote.data.params.iter().any(|p| p == param) {
            return true;
        }
    }
    for tag in &local.data.tags {
        if !remote.data.tags.iter().any(|t| t == tag) {
            return true;
        }
    }
    for sample in &local.data.metrics {
        let matched = remote
            .data
            .metrics
            .iter()
            .any(|m| m.key == sample.key && m.value == sample.value && m.step == sample.step);
        if !matched {
            return true;
        }
    }
    false
}

/// Read-back check after a push. Mismatches are logged, never fatal; the
/// next pass tries again if the drift persists.
fn verify_run_update(desired: &Run, actual: &Run) {
    let run_id = desired.info.run_id.as_str();
    if actual.info.name != desired.info.name {
        warn!(run_id, "run name did not stick on the platform");
    }
    if actual.info.status != desired.info.status {
        warn!(
            run_id,
            expected = %desired.info.status,
            got = %actual.info.status,
            "run status did not stick"
        );
    }
    if actual.info.start_time != desired.info.start_time {
        warn!(run_id, "run start time differs on the platform");
    }
    if actual.info.end_time != desired.info.end_time {
        warn!(run_id, "run end time did not stick");
    }
    if !desired.info.lifecycle_stage.is_empty()
        && actual.info.lifecycle_stage != desired.info.lifecycle_stage
    {
        warn!(run_id, "run lifecycle stage did not stick");
    }
    if actual.data.metrics.len() < desired.data.metrics.len() {
        warn!(
            run_id,
            pushed = desired.data.metrics.len(),
            stored = actual.data.metrics.len(),
            "platform kept fewer metrics than pushed"
        );
    }
}

#[async_trait]
impl Reconciler<i64> for RunReconciler {
    fn name(&self) -> &str {
        "runs"
    }

    async fn reboot(&self) -> Result<(), BoxError> {
        // Flags live in the mirror store; the first scan picks them up.
        Ok(())
    }

    async fn resync(&self, queue: &ReconcileQueue<i64>) -> Result<(), BoxError> {
        let ids = self
            .store
            .list_ids_for_run_reconciliation(self.resync_max_items)
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

#[cfg(test)]
mod tests {
    use graft_types::{MetricSample, RunInfo, RunParam, RunTag};

    use super::*;

    fn named_run(name: &str) -> Run {
        Run {
            info: RunInfo {
                run_id: "r1".to_string(),
                name: name.to_string(),
                experiment_id: "7".to_string(),
                status: RunStatus::Running,
                start_time: 1_700_000_000_000,
                lifecycle_stage: "active".to_string(),
                ..RunInfo::default()
            },
            ..Run::default()
        }
    }

    #[test]
    fn extra_platform_data_is_not_drift() {
        let local = named_run("trial");
        let mut remote = named_run("trial");
        remote.data.params.push(RunParam {
            key: "server-added".to_string(),
            value: "1".to_string(),
        });
        remote.data.tags.push(RunTag {
            key: "mlflow.user".to_string(),
            value: "svc".to_string(),
        });
        assert!(!run_differs(&local, &remote));
    }

    #[test]
    fn missing_local_state_is_drift() {
        let mut local = named_run("trial");
        let remote = named_run("trial");
        local.data.params.push(RunParam {
            key: "lr".to_string(),
            value: "0.01".to_string(),
        });
        assert!(run_differs(&local, &remote));

        let mut local = named_run("trial");
        local.data.metrics.push(MetricSample {
            key: "loss".to_string(),
            value: 0.4,
            timestamp: 1_700_000_100,
            step: 2,
        });
        assert!(run_differs(&local, &remote));
    }

    #[test]
    fn lifecycle_and_status_changes_are_drift() {
        let mut local = named_run("trial");
        let remote = named_run("trial");
        local.info.status = RunStatus::Finished;
        local.info.end_time = 1_700_000_200_000;
        assert!(run_differs(&local, &remote));

        let mut local = named_run("trial");
        local.info.lifecycle_stage = "deleted".to_string();
        assert!(run_differs(&local, &remote));

        // A local run that never reports a stage cannot drift on it.
        let mut local = named_run("trial");
        local.info.lifecycle_stage = String::new();
        assert!(!run_differs(&local, &remote));
    }
}
