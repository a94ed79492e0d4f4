//! Stage 1: experiment discovery and materialization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use graft_reconcile::{BoxError, ReconcileItem, ReconcileQueue, Reconciler};
use graft_store::{MirrorStore, NewExperiment};
use graft_tracking::TrackingPair;
use tracing::{debug, info};

/// Mirrors experiments from the local server and materializes them on the
/// platform.
///
/// Keys are local experiment ids. A reconciled experiment ends up with a
/// mirror row whose `created` flag stays set for good, which is what keeps
/// the run stage scanning it for new runs.
pub struct ExperimentReconciler {
    store: Arc<dyn MirrorStore>,
    tracking: TrackingPair,
    resync_max_items: usize,
}

impl ExperimentReconciler {
    pub fn new(store: Arc<dyn MirrorStore>, tracking: TrackingPair, resync_max_items: usize) -> Self {
        ExperimentReconciler {
            store,
            tracking,
            resync_max_items,
        }
    }

    async fn reconcile_one(&self, experiment_id: &str) -> Result<(), BoxError> {
        let experiment = match self.tracking.local.get_experiment(experiment_id).await? {
            Some(experiment) => experiment,
            None => {
                debug!(experiment_id, "experiment gone from the local server, dropping");
                return Ok(());
            }
        };

        let record = match self.store.get_experiment(experiment_id).await? {
            Some(record) => {
                if record.deleted {
                    debug!(experiment_id, "mirror row is deleted, leaving it alone");
                    return Ok(());
                }
                if let Some(at) = experiment.updated_at() {
                    if at > record.updated_ts {
                        self.store.set_experiment_updated(record.id, true, at).await?;
                        debug!(experiment_id, "flagged experiment for a run pass");
                    }
                }
                record
            }
            None => {
                let now = Utc::now();
                let record = self
                    .store
                    .create_experiment(NewExperiment {
                        experiment_id: experiment_id.to_string(),
                        name: experiment.name.clone(),
                        created: true,
                        updated: true,
                        created_ts: experiment.created_at().unwrap_or(now),
                        updated_ts: experiment.updated_at().unwrap_or(now),
                    })
                    .await?;
                info!(experiment_id, name = %record.name, "mirrored new experiment");
                record
            }
        };

        if !record.has_remote() {
            self.ensure_remote(record.id, experiment_id, &experiment.name).await?;
        }
        Ok(())
    }

    /// Adopts an existing platform experiment of the same name, or creates
    /// one. Looking up by name first keeps retries from piling up
    /// duplicates when a previous attempt died between create and record.
    async fn ensure_remote(
        &self,
        record_id: i64,
        experiment_id: &str,
        name: &str,
    ) -> Result<(), BoxError> {
        let remote_id = match self.tracking.remote.get_experiment_by_name(name).await? {
            Some(remote) if !remote.experiment_id.is_empty() => remote.experiment_id,
            _ => self.tracking.remote.create_experiment(name).await?,
        };
        self.store.set_remote_experiment_id(record_id, &remote_id).await?;
        info!(experiment_id, remote_experiment_id = %remote_id, "experiment present on the platform");
        Ok(())
    }
}

#[async_trait]
impl Reconciler<String> for ExperimentReconciler {
    fn name(&self) -> &str {
        "experiments"
    }

    async fn reboot(&self) -> Result<(), BoxError> {
        // Nothing carries over between processes; the first scan rebuilds
        // the queue from the server listing.
        Ok(())
    }

    async fn resync(&self, queue: &ReconcileQueue<String>) -> Result<(), BoxError> {
        let (experiments, _) = self
            .tracking
            .local
            .list_experiments(self.resync_max_items, "")
            .await?;
        let mut enqueued = 0usize;
        for experiment in experiments {
            // The server-provided default experiment is never synced.
            if experiment.experiment_id.is_empty()
                || experiment.experiment_id == "0"
                || experiment.name == "Default"
            {
                continue;
            }
            let wanted = match self.store.get_experiment(&experiment.experiment_id).await? {
                None => true,
                Some(record) if record.deleted => false,
                Some(record) => {
                    !record.has_remote()
                        || experiment
                            .updated_at()
                            .map_or(false, |at| at > record.updated_ts)
                }
            };
            if wanted {
                queue.add(experiment.experiment_id);
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(enqueued, "experiment scan queued work");
        }
        Ok(())
    }

    async fn reconcile(&self, items: Vec<ReconcileItem<String>>) -> Result<(), BoxError> {
        for item in items {
            let experiment_id = item.key().clone();
            match self.reconcile_one(&experiment_id).await {
                Ok(()) => item.complete(),
                Err(error) => item.fail(error),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use graft_store::{ExperimentStore, MemoryStore};
    use graft_tracking::{MemoryTrackingStore, TrackingStore};
    use graft_types::Experiment;

    use super::*;

    fn experiment(id: &str, name: &str, updated_millis: i64) -> Experiment {
        Experiment {
            experiment_id: id.to_string(),
            name: name.to_string(),
            lifecycle_stage: "active".to_string(),
            created_time: updated_millis,
            last_updated_time: updated_millis,
            ..Experiment::default()
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        local: Arc<MemoryTrackingStore>,
        remote: Arc<MemoryTrackingStore>,
        reconciler: ExperimentReconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryTrackingStore::new());
        let remote = Arc::new(MemoryTrackingStore::new());
        let reconciler = ExperimentReconciler::new(
            store.clone(),
            TrackingPair::new(local.clone(), remote.clone()),
            1000,
        );
        Harness {
            store,
            local,
            remote,
            reconciler,
        }
    }

    async fn assert_drained(queue: &Arc<ReconcileQueue<String>>) {
        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.pop(10)).await;
        assert!(blocked.is_err(), "queue should have been empty");
    }

    #[tokio::test(start_paused = true)]
    async fn scan_skips_the_default_experiment() {
        let h = harness();
        h.local.seed_experiment(experiment("0", "Default", 1_700_000_000_000));
        h.local.seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));

        let queue = ReconcileQueue::new();
        h.reconciler.resync(&queue).await.unwrap();
        let items = queue.pop(10).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key(), "7");
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_mirrors_and_materializes() {
        let h = harness();
        h.local.seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));

        let queue = ReconcileQueue::new();
        h.reconciler.resync(&queue).await.unwrap();
        let items = queue.pop(10).await;
        h.reconciler.reconcile(items).await.unwrap();

        let record = h.store.get_experiment("7").await.unwrap().unwrap();
        assert!(record.created && record.updated);
        assert!(record.has_remote());
        assert_eq!(h.remote.create_experiment_calls(), 1);
        let remote_id = record.remote_experiment_id.unwrap();
        let remote = h.remote.get_experiment(&remote_id).await.unwrap().unwrap();
        assert_eq!(remote.name, "churn-model");

        // Nothing changed at the source, so the next scan finds no work.
        h.reconciler.resync(&queue).await.unwrap();
        assert_drained(&queue).await;
    }

    #[tokio::test(start_paused = true)]
    async fn source_update_reflags_the_mirror_row() {
        let h = harness();
        h.local.seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));

        let queue = ReconcileQueue::new();
        h.reconciler.resync(&queue).await.unwrap();
        h.reconciler.reconcile(queue.pop(10).await).await.unwrap();
        let record = h.store.get_experiment("7").await.unwrap().unwrap();
        h.store
            .set_experiment_updated(record.id, false, record.updated_ts)
            .await
            .unwrap();

        // Same timestamp again must not flag; only strictly newer does.
        h.reconciler.resync(&queue).await.unwrap();
        assert_drained(&queue).await;

        // Replaying the reconcile itself is just as much of a no-op.
        queue.add("7".to_string());
        h.reconciler.reconcile(queue.pop(10).await).await.unwrap();
        let replayed = h.store.get_experiment("7").await.unwrap().unwrap();
        assert!(!replayed.updated);
        assert_eq!(replayed.updated_ts, record.updated_ts);

        h.local.seed_experiment(experiment("7", "churn-model", 1_700_000_600_000));
        h.reconciler.resync(&queue).await.unwrap();
        h.reconciler.reconcile(queue.pop(10).await).await.unwrap();

        let record = h.store.get_experiment("7").await.unwrap().unwrap();
        assert!(record.updated);
        assert_eq!(record.updated_ts.timestamp_millis(), 1_700_000_600_000);
        assert_eq!(h.remote.create_experiment_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn materialization_adopts_platform_experiment_by_name() {
        let h = harness();
        h.local.seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
        h.remote.seed_experiment(experiment("43", "churn-model", 1_600_000_000_000));

        let queue = ReconcileQueue::new();
        h.reconciler.resync(&queue).await.unwrap();
        h.reconciler.reconcile(queue.pop(10).await).await.unwrap();

        let record = h.store.get_experiment("7").await.unwrap().unwrap();
        assert_eq!(record.remote_experiment_id.as_deref(), Some("43"));
        assert_eq!(h.remote.create_experiment_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_experiment_settles_without_retry() {
        let h = harness();
        let queue = ReconcileQueue::new();
        queue.add("ghost".to_string());
        h.reconciler.reconcile(queue.pop(10).await).await.unwrap();

        // A retry would surface within the backoff window; nothing should.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_drained(&queue).await;
        assert!(h.store.get_experiment("ghost").await.unwrap().is_none());
    }
}
