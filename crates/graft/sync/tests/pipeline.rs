//! End-to-end pipeline behavior against in-memory servers and store.

use std::sync::Arc;
use std::time::Duration;

use graft_reconcile::{ReconcileKey, ReconcileQueue, Reconciler};
use graft_store::{ExperimentStore, MemoryStore, MetricStore, RunStore};
use graft_sync::{
    ExperimentReconciler, MetricsReconciler, ReconcilerSet, RunReconciler, SyncConfig,
};
use graft_tracking::{MemoryTrackingStore, TrackingPair, TrackingStore};
use graft_types::{Experiment, MetricSample, Run, RunData, RunInfo, RunParam, RunStatus, RunTag};

struct World {
    store: Arc<MemoryStore>,
    local: Arc<MemoryTrackingStore>,
    remote: Arc<MemoryTrackingStore>,
    pair: TrackingPair,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let local = Arc::new(MemoryTrackingStore::new());
    let remote = Arc::new(MemoryTrackingStore::new());
    let pair = TrackingPair::new(local.clone(), remote.clone());
    World {
        store,
        local,
        remote,
        pair,
    }
}

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

fn local_run(experiment_id: &str, run_id: &str, name: &str) -> Run {
    Run {
        info: RunInfo {
            run_id: run_id.to_string(),
            name: name.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: 1_700_000_000_000,
            lifecycle_stage: "active".to_string(),
            ..RunInfo::default()
        },
        data: RunData {
            metrics: vec![MetricSample {
                key: "loss".to_string(),
                value: 0.35,
                timestamp: 1_700_000_200,
                step: 2,
            }],
            params: vec![RunParam {
                key: "lr".to_string(),
                value: "0.01".to_string(),
            }],
            tags: vec![RunTag {
                key: "team".to_string(),
                value: "growth".to_string(),
            }],
            files: Vec::new(),
        },
    }
}

/// One scan plus however many pops it takes to drain the resulting work.
async fn drive_stage<K: ReconcileKey, R: Reconciler<K>>(reconciler: &R) {
    let queue = ReconcileQueue::new();
    reconciler.resync(&queue).await.unwrap();
    loop {
        let items = match tokio::time::timeout(Duration::from_millis(50), queue.pop(16)).await {
            Ok(items) if !items.is_empty() => items,
            _ => break,
        };
        reconciler.reconcile(items).await.unwrap();
    }
    queue.shut_down();
}

#[tokio::test]
async fn experiments_propagate_to_mirror_and_platform() {
    let w = world();
    w.local
        .seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
    let stage = ExperimentReconciler::new(w.store.clone(), w.pair.clone(), 1000);

    drive_stage(&stage).await;

    let record = w.store.get_experiment("7").await.unwrap().unwrap();
    assert!(record.created && record.updated);
    assert!(record.has_remote());
    let remote_id = record.remote_experiment_id.unwrap();
    let on_platform = w.remote.get_experiment(&remote_id).await.unwrap().unwrap();
    assert_eq!(on_platform.name, "churn-model");

    // Driving again without source changes creates nothing new.
    drive_stage(&stage).await;
    assert_eq!(w.remote.create_experiment_calls(), 1);
}

#[tokio::test]
async fn runs_push_to_platform_exactly_once() {
    let w = world();
    w.local
        .seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
    w.local.seed_run(local_run("7", "r1", "trial-1"));

    let experiments = ExperimentReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    let runs = RunReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    drive_stage(&experiments).await;
    drive_stage(&runs).await;

    assert_eq!(w.remote.create_run_calls(), 1);
    assert_eq!(w.remote.update_run_calls(), 1);

    let row = w.store.get_run("7", "r1").await.unwrap().unwrap();
    assert!(row.has_remote());
    assert!(row.reconcile_metrics);
    let remote_run_id = row.remote_run_id.unwrap();
    let on_platform = w.remote.get_run(&remote_run_id).await.unwrap().unwrap();
    assert_eq!(on_platform.info.name, "trial-1");
    assert_eq!(
        on_platform.data.params,
        vec![RunParam {
            key: "lr".to_string(),
            value: "0.01".to_string(),
        }]
    );

    // The pass cleared `updated` but the experiment stays in the scan
    // through its standing `created` flag.
    let exp_row = w.store.get_experiment("7").await.unwrap().unwrap();
    assert!(exp_row.created && !exp_row.updated);
    assert_eq!(
        w.store.list_ids_for_run_reconciliation(10).await.unwrap(),
        vec![exp_row.id]
    );

    // A second pass finds no drift and touches the platform read-only.
    drive_stage(&runs).await;
    assert_eq!(w.remote.create_run_calls(), 1);
    assert_eq!(w.remote.update_run_calls(), 1);
}

#[tokio::test]
async fn new_runs_surface_without_source_updates() {
    let w = world();
    w.local
        .seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
    w.local.seed_run(local_run("7", "r1", "trial-1"));

    let experiments = ExperimentReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    let runs = RunReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    drive_stage(&experiments).await;
    drive_stage(&runs).await;

    // The experiment is quiet, yet a run logged later must still be found.
    w.local.seed_run(local_run("7", "r2", "trial-2"));
    drive_stage(&runs).await;

    let row = w.store.get_run("7", "r2").await.unwrap().unwrap();
    assert!(row.has_remote());
    assert_eq!(w.remote.create_run_calls(), 2);
}

#[tokio::test]
async fn full_chain_lands_metrics_in_the_mirror() {
    let w = world();
    w.local
        .seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
    w.local.seed_run(local_run("7", "r1", "trial-1"));

    let experiments = ExperimentReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    let runs = RunReconciler::new(w.store.clone(), w.pair.clone(), 1000);
    let metrics = MetricsReconciler::new(w.store.clone(), w.pair.clone(), 1000);

    drive_stage(&experiments).await;
    drive_stage(&runs).await;
    drive_stage(&metrics).await;

    let loss = w
        .store
        .get_metric_by_name("7", "r1", "loss")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loss.value_numeric, Some(0.35));
    assert_eq!(loss.tags.get("step").map(String::as_str), Some("2"));

    let row = w.store.get_run("7", "r1").await.unwrap().unwrap();
    assert!(!row.reconcile_metrics, "sweep should clear the flag");
}

#[tokio::test]
async fn scan_bound_caps_work_per_pass() {
    let w = world();
    for n in 0..5 {
        w.local.seed_experiment(experiment(
            &(n + 1).to_string(),
            &format!("exp-{n}"),
            1_700_000_000_000,
        ));
    }
    let stage = ExperimentReconciler::new(w.store.clone(), w.pair.clone(), 2);

    let queue = ReconcileQueue::new();
    stage.resync(&queue).await.unwrap();
    let items = queue.pop(16).await;
    assert_eq!(items.len(), 2, "scan must consider at most the configured bound");
    queue.shut_down();
}

#[tokio::test(start_paused = true)]
async fn reconciler_set_runs_the_whole_pipeline() {
    let w = world();
    w.local
        .seed_experiment(experiment("7", "churn-model", 1_700_000_000_000));
    w.local.seed_run(local_run("7", "r1", "trial-1"));

    let config = SyncConfig {
        resync_frequency_secs: 1,
        max_workers: 2,
        run_max_items: 4,
        ..SyncConfig::default()
    };
    let mut set = ReconcilerSet::new(
        w.store.clone(),
        w.pair.clone(),
        &config,
        &config,
        &config,
    )
    .await
    .unwrap();
    set.start();

    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if w.store
            .get_metric_by_name("7", "r1", "loss")
            .await
            .unwrap()
            .is_some()
        {
            break;
        }
    }
    set.finish().await;

    let loss = w.store.get_metric_by_name("7", "r1", "loss").await.unwrap();
    assert_eq!(loss.and_then(|m| m.value_numeric), Some(0.35));
}
