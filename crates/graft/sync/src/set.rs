//! Assembles the pipeline stages into one unit.

use std::sync::Arc;

use graft_reconcile::{Manager, ReconcileResult};
use graft_store::MirrorStore;
use graft_tracking::TrackingPair;
use tracing::info;

use crate::config::SyncConfig;
use crate::experiments::ExperimentReconciler;
use crate::metrics::MetricsReconciler;
use crate::runs::RunReconciler;

/// The managers of every enabled pipeline stage.
///
/// Stages are independent: disabling one leaves the others running, and
/// the flags it would have consumed simply wait in the mirror store.
pub struct ReconcilerSet {
    experiments: Option<Manager<String>>,
    runs: Option<Manager<i64>>,
    metrics: Option<Manager<i64>>,
}

impl ReconcilerSet {
    /// Validates each enabled stage's settings, builds its manager, and
    /// runs its reboot hook. Disabled stages are skipped entirely.
    pub async fn new(
        store: Arc<dyn MirrorStore>,
        tracking: TrackingPair,
        experiments: &SyncConfig,
        runs: &SyncConfig,
        metrics: &SyncConfig,
    ) -> ReconcileResult<Self> {
        let mut set = ReconcilerSet {
            experiments: None,
            runs: None,
            metrics: None,
        };

        if experiments.enabled {
            experiments.validate()?;
            let reconciler = ExperimentReconciler::new(
                store.clone(),
                tracking.clone(),
                experiments.resync_max_items,
            );
            set.experiments =
                Some(Manager::new(Arc::new(reconciler), experiments.manager_config()).await?);
        } else {
            info!("experiment stage disabled");
        }

        if runs.enabled {
            runs.validate()?;
            let reconciler =
                RunReconciler::new(store.clone(), tracking.clone(), runs.resync_max_items);
            set.runs = Some(Manager::new(Arc::new(reconciler), runs.manager_config()).await?);
        } else {
            info!("run stage disabled");
        }

        if metrics.enabled {
            metrics.validate()?;
            let reconciler =
                MetricsReconciler::new(store.clone(), tracking.clone(), metrics.resync_max_items);
            set.metrics = Some(Manager::new(Arc::new(reconciler), metrics.manager_config()).await?);
        } else {
            info!("metric stage disabled");
        }

        Ok(set)
    }

    /// True when no stage is enabled.
    pub fn is_empty(&self) -> bool {
        self.experiments.is_none() && self.runs.is_none() && self.metrics.is_none()
    }

    /// Starts the scan and worker tasks of every enabled stage.
    pub fn start(&mut self) {
        if let Some(manager) = &mut self.experiments {
            manager.start();
            info!(stage = manager.name(), "stage started");
        }
        if let Some(manager) = &mut self.runs {
            manager.start();
            info!(stage = manager.name(), "stage started");
        }
        if let Some(manager) = &mut self.metrics {
            manager.start();
            info!(stage = manager.name(), "stage started");
        }
    }

    /// Stops every stage, upstream first, draining in-flight work.
    pub async fn finish(&mut self) {
        if let Some(manager) = &mut self.experiments {
            manager.finish().await;
            info!(stage = manager.name(), "stage finished");
        }
        if let Some(manager) = &mut self.runs {
            manager.finish().await;
            info!(stage = manager.name(), "stage finished");
        }
        if let Some(manager) = &mut self.metrics {
            manager.finish().await;
            info!(stage = manager.name(), "stage finished");
        }
    }
}
