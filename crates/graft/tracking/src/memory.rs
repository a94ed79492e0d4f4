//! In-process tracking server fake.
//!
//! Backs the pipeline test suites. State is seeded directly and the store
//! counts mutating calls, so tests can assert both what ended up on the
//! server and how many pushes it took to get there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graft_types::{Artifact, Experiment, MetricSample, Run, RunData, RunInfo, RunStatus, RunTag};
use uuid::Uuid;

use crate::error::{TrackingError, TrackingResult};
use crate::store::TrackingStore;

fn read_guard<'a, T>(lock: &'a RwLock<T>, what: &str) -> TrackingResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| TrackingError::Transport(format!("{what} lock poisoned")))
}

fn write_guard<'a, T>(lock: &'a RwLock<T>, what: &str) -> TrackingResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| TrackingError::Transport(format!("{what} lock poisoned")))
}

/// Tracking server stand-in keeping everything in process memory.
#[derive(Default)]
pub struct MemoryTrackingStore {
    experiments: RwLock<HashMap<String, Experiment>>,
    runs: RwLock<HashMap<String, Run>>,
    histories: RwLock<HashMap<String, Vec<MetricSample>>>,
    artifacts: RwLock<HashMap<String, Vec<(Artifact, Vec<u8>)>>>,
    next_experiment_id: AtomicI64,
    create_experiment_calls: AtomicUsize,
    create_run_calls: AtomicUsize,
    update_run_calls: AtomicUsize,
}

impl MemoryTrackingStore {
    /// Creates an empty fake server.
    pub fn new() -> Self {
        MemoryTrackingStore {
            next_experiment_id: AtomicI64::new(1),
            ..MemoryTrackingStore::default()
        }
    }

    /// Places an experiment on the server as-is.
    pub fn seed_experiment(&self, experiment: Experiment) {
        if let Ok(mut experiments) = self.experiments.write() {
            experiments.insert(experiment.experiment_id.clone(), experiment);
        }
    }

    /// Places a run on the server as-is.
    pub fn seed_run(&self, run: Run) {
        if let Ok(mut runs) = self.runs.write() {
            runs.insert(run.info.run_id.clone(), run);
        }
    }

    /// Replaces the stored metric history of a run.
    pub fn seed_metric_history(&self, run_id: &str, samples: Vec<MetricSample>) {
        if let Ok(mut histories) = self.histories.write() {
            histories.insert(run_id.to_string(), samples);
        }
    }

    /// Adds an artifact file with contents under a run.
    pub fn seed_artifact(&self, run_id: &str, artifact: Artifact, contents: impl Into<Vec<u8>>) {
        if let Ok(mut artifacts) = self.artifacts.write() {
            artifacts
                .entry(run_id.to_string())
                .or_default()
                .push((artifact, contents.into()));
        }
    }

    /// Number of `create_experiment` calls served.
    pub fn create_experiment_calls(&self) -> usize {
        self.create_experiment_calls.load(Ordering::Relaxed)
    }

    /// Number of `create_run` calls served.
    pub fn create_run_calls(&self) -> usize {
        self.create_run_calls.load(Ordering::Relaxed)
    }

    /// Number of `update_run` calls served.
    pub fn update_run_calls(&self) -> usize {
        self.update_run_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TrackingStore for MemoryTrackingStore {
    async fn list_experiments(
        &self,
        max_items: usize,
        page_token: &str,
    ) -> TrackingResult<(Vec<Experiment>, Option<String>)> {
        let experiments = read_guard(&self.experiments, "experiment")?;
        let mut all: Vec<Experiment> = experiments.values().cloned().collect();
        all.sort_by(|a, b| {
            let left = a.experiment_id.parse::<i64>().unwrap_or(i64::MAX);
            let right = b.experiment_id.parse::<i64>().unwrap_or(i64::MAX);
            left.cmp(&right).then_with(|| a.experiment_id.cmp(&b.experiment_id))
        });

        let offset: usize = if page_token.is_empty() {
            0
        } else {
            page_token.parse().unwrap_or(0)
        };
        let total = all.len();
        let page: Vec<Experiment> = all.into_iter().skip(offset).take(max_items).collect();
        let next = (offset + max_items < total).then(|| (offset + max_items).to_string());
        Ok((page, next))
    }

    async fn get_experiment(&self, experiment_id: &str) -> TrackingResult<Option<Experiment>> {
        let experiments = read_guard(&self.experiments, "experiment")?;
        Ok(experiments.get(experiment_id).cloned())
    }

    async fn get_experiment_by_name(&self, name: &str) -> TrackingResult<Option<Experiment>> {
        let experiments = read_guard(&self.experiments, "experiment")?;
        let mut matches: Vec<&Experiment> = experiments
            .values()
            .filter(|experiment| experiment.name == name)
            .collect();
        matches.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        Ok(matches.first().map(|experiment| (*experiment).clone()))
    }

    async fn create_experiment(&self, name: &str) -> TrackingResult<String> {
        self.create_experiment_calls.fetch_add(1, Ordering::Relaxed);
        let mut experiments = write_guard(&self.experiments, "experiment")?;
        let mut id = self.next_experiment_id.fetch_add(1, Ordering::Relaxed);
        while experiments.contains_key(&id.to_string()) {
            id = self.next_experiment_id.fetch_add(1, Ordering::Relaxed);
        }
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        let experiment = Experiment {
            experiment_id: id.clone(),
            name: name.to_string(),
            lifecycle_stage: "active".to_string(),
            created_time: now,
            last_updated_time: now,
            ..Experiment::default()
        };
        experiments.insert(id.clone(), experiment);
        Ok(id)
    }

    async fn list_runs(&self, experiment_id: &str) -> TrackingResult<Vec<Run>> {
        let runs = read_guard(&self.runs, "run")?;
        let mut matches: Vec<Run> = runs
            .values()
            .filter(|run| run.info.experiment_id == experiment_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.info.run_id.cmp(&b.info.run_id));
        Ok(matches)
    }

    async fn get_run(&self, run_id: &str) -> TrackingResult<Option<Run>> {
        let runs = read_guard(&self.runs, "run")?;
        Ok(runs.get(run_id).cloned())
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        tags: &[RunTag],
    ) -> TrackingResult<String> {
        self.create_run_calls.fetch_add(1, Ordering::Relaxed);
        let run_id = Uuid::new_v4().simple().to_string();
        let run = Run {
            info: RunInfo {
                run_id: run_id.clone(),
                name: name.to_string(),
                experiment_id: experiment_id.to_string(),
                status: RunStatus::Running,
                start_time: start_time.timestamp_millis(),
                lifecycle_stage: "active".to_string(),
                ..RunInfo::default()
            },
            data: RunData {
                tags: tags.to_vec(),
                ..RunData::default()
            },
        };
        let mut runs = write_guard(&self.runs, "run")?;
        runs.insert(run_id.clone(), run);
        Ok(run_id)
    }

    async fn update_run(&self, run: &Run) -> TrackingResult<Run> {
        self.update_run_calls.fetch_add(1, Ordering::Relaxed);
        let mut runs = write_guard(&self.runs, "run")?;
        if !runs.contains_key(&run.info.run_id) {
            return Err(TrackingError::Api {
                status: 404,
                message: format!("run {} not found", run.info.run_id),
            });
        }
        runs.insert(run.info.run_id.clone(), run.clone());

        // Pushed samples become part of the stored history, like a real
        // server folding a log batch in.
        let mut histories = write_guard(&self.histories, "history")?;
        let history = histories.entry(run.info.run_id.clone()).or_default();
        for sample in &run.data.metrics {
            let known = history.iter().any(|existing| {
                existing.key == sample.key
                    && existing.step == sample.step
                    && existing.timestamp == sample.timestamp
            });
            if !known {
                history.push(sample.clone());
            }
        }
        Ok(run.clone())
    }

    async fn metrics(
        &self,
        _experiment_id: &str,
        run_id: &str,
    ) -> TrackingResult<Vec<MetricSample>> {
        let histories = read_guard(&self.histories, "history")?;
        let mut samples = histories.get(run_id).cloned().unwrap_or_default();
        samples.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.step.cmp(&b.step))
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(samples)
    }

    async fn artifacts(&self, run_id: &str, path: Option<&str>) -> TrackingResult<Vec<Artifact>> {
        let artifacts = read_guard(&self.artifacts, "artifact")?;
        let entries = artifacts.get(run_id).cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|(artifact, _)| artifact)
            .filter(|artifact| path.map_or(true, |prefix| artifact.path.starts_with(prefix)))
            .collect())
    }

    async fn get_artifact(&self, run_id: &str, path: &str) -> TrackingResult<Vec<u8>> {
        let artifacts = read_guard(&self.artifacts, "artifact")?;
        artifacts
            .get(run_id)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(artifact, _)| artifact.path == path)
                    .map(|(_, contents)| contents.clone())
            })
            .ok_or_else(|| TrackingError::Api {
                status: 404,
                message: format!("artifact {path} not found for run {run_id}"),
            })
    }
}
