//! The client trait reconcilers run against.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graft_types::{Artifact, Experiment, MetricSample, Run, RunTag};

use crate::error::TrackingResult;

/// Read and write access to one tracking server.
///
/// Lookups by id return `Ok(None)` when the server does not know the
/// entity, so callers can treat "not there yet" as ordinary control flow
/// on eventually-consistent servers.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// One page of experiments. An empty `page_token` starts from the
    /// beginning; the returned token, when present, continues the listing.
    async fn list_experiments(
        &self,
        max_items: usize,
        page_token: &str,
    ) -> TrackingResult<(Vec<Experiment>, Option<String>)>;

    /// Looks up an experiment by id.
    async fn get_experiment(&self, experiment_id: &str) -> TrackingResult<Option<Experiment>>;

    /// Looks up an experiment by its exact name.
    async fn get_experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>>;

    /// Creates an experiment and returns the id the server assigned.
    async fn create_experiment(&self, name: &str) -> TrackingResult<String>;

    /// All runs logged under an experiment.
    async fn list_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>>;

    /// Looks up a run by id.
    async fn get_run(&self, run_id: &str) -> TrackingResult<Option<Run>>;

    /// Creates a run and returns the id the server assigned.
    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        tags: &[RunTag],
    ) -> TrackingResult<String>;

    /// Pushes a run's info and logged data, then returns the server's
    /// resulting view of the run.
    async fn update_run(&self, run: &Run) -> TrackingResult<Run>;

    /// Full metric history of a run, every sample of every key.
    async fn metrics(
        &self,
        experiment_id: &str,
        run_id: &str,
    ) -> TrackingResult<Vec<MetricSample>>;

    /// Artifact listing of a run, optionally below a path prefix.
    async fn artifacts(&self, run_id: &str, path: Option<&str>) -> TrackingResult<Vec<Artifact>>;

    /// Raw contents of one artifact file.
    async fn get_artifact(&self, run_id: &str, path: &str) -> TrackingResult<Vec<u8>>;
}

/// The two servers a deployment reconciles between.
#[derive(Clone)]
pub struct TrackingPair {
    /// Workspace-local server; the source runs are discovered from.
    pub local: Arc<dyn TrackingStore>,
    /// Cluster-wide platform server; the push target.
    pub remote: Arc<dyn TrackingStore>,
}

impl TrackingPair {
    /// Bundles a local and a remote client.
    pub fn new(local: Arc<dyn TrackingStore>, remote: Arc<dyn TrackingStore>) -> Self {
        TrackingPair { local, remote }
    }
}
