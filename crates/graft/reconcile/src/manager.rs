use crate::error::{ReconcileError, ReconcileResult};
use crate::queue::{ReconcileKey, ReconcileQueue};
use crate::reconciler::Reconciler;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime settings for one [`Manager`]. Validated at construction; invalid
/// values never make it past startup.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between resync scans.
    pub resync_frequency: Duration,
    /// Number of concurrent reconcile workers.
    pub max_workers: usize,
    /// Largest batch one worker pops at a time.
    pub run_max_items: usize,
}

impl ManagerConfig {
    pub const MIN_RESYNC_FREQUENCY: Duration = Duration::from_millis(1);

    pub fn validate(&self) -> ReconcileResult<()> {
        if self.resync_frequency < Self::MIN_RESYNC_FREQUENCY {
            return Err(ReconcileError::InvalidResyncFrequency(
                self.resync_frequency,
            ));
        }
        if self.max_workers < 1 {
            return Err(ReconcileError::InvalidMaxWorkers(self.max_workers));
        }
        if self.run_max_items < 1 {
            return Err(ReconcileError::InvalidRunMaxItems(self.run_max_items));
        }
        Ok(())
    }
}

/// Drives one [`Reconciler`]: a periodic resync scan feeding the queue, plus
/// a fixed pool of workers draining it in bounded batches.
pub struct Manager<K: ReconcileKey> {
    reconciler: Arc<dyn Reconciler<K>>,
    config: ManagerConfig,
    queue: Arc<ReconcileQueue<K>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<K: ReconcileKey> std::fmt::Debug for Manager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("reconciler", &self.reconciler.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K: ReconcileKey> Manager<K> {
    /// Validate the config and run the reconciler's one-time reboot hook
    /// before any task starts.
    pub async fn new(
        reconciler: Arc<dyn Reconciler<K>>,
        config: ManagerConfig,
    ) -> ReconcileResult<Self> {
        config.validate()?;

        if let Err(e) = reconciler.reboot().await {
            return Err(ReconcileError::RebootFailed {
                name: reconciler.name().to_string(),
                reason: e.to_string(),
            });
        }
        debug!(reconciler = reconciler.name(), "reboot complete");

        Ok(Self {
            queue: ReconcileQueue::new(),
            reconciler,
            config,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.reconciler.name()
    }

    /// Handle to the queue feeding this manager's workers, for callers that
    /// want to enqueue a key outside the resync cadence.
    pub fn queue(&self) -> Arc<ReconcileQueue<K>> {
        Arc::clone(&self.queue)
    }

    /// Spawn the resync task and the worker pool. Call once.
    pub fn start(&mut self) {
        info!(
            reconciler = self.reconciler.name(),
            workers = self.config.max_workers,
            frequency_ms = self.config.resync_frequency.as_millis() as u64,
            "starting reconcile manager"
        );

        let reconciler = Arc::clone(&self.reconciler);
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        let frequency = self.config.resync_frequency;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // The first tick fires immediately, so a fresh manager scans
                // without waiting a full interval.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = reconciler.resync(&queue).await {
                    warn!(reconciler = reconciler.name(), error = %e, "resync scan failed");
                }
            }
            debug!(reconciler = reconciler.name(), "resync loop stopped");
        }));

        for worker in 0..self.config.max_workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            let cancel = self.cancel.clone();
            let max_items = self.config.run_max_items;
            self.tasks.push(tokio::spawn(async move {
                while !cancel.is_cancelled() {
                    let items = queue.pop(max_items).await;
                    if items.is_empty() {
                        // pop returns empty only once the queue shuts down
                        break;
                    }
                    if let Err(e) = reconciler.reconcile(items).await {
                        error!(
                            reconciler = reconciler.name(),
                            worker,
                            error = %e,
                            "reconcile batch failed"
                        );
                    }
                }
                debug!(reconciler = reconciler.name(), worker, "worker stopped");
            }));
        }
    }

    /// Stop the resync task and workers and wait for them to drain.
    ///
    /// Cancellation is observed between batches, never mid-batch, so this
    /// returns within one batch's worst-case duration.
    pub async fn finish(&mut self) {
        info!(reconciler = self.reconciler.name(), "stopping reconcile manager");
        self.cancel.cancel();
        self.queue.shut_down();

        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                error!(
                    reconciler = self.reconciler.name(),
                    error = %e,
                    "reconcile task terminated abnormally"
                );
            }
        }
        info!(reconciler = self.reconciler.name(), "reconcile manager stopped");
    }
}
