//! Durable mirror of the tracking state graft reconciles against.
//!
//! Every experiment, run, and metric the sync pipeline touches is recorded
//! here first. The mirror rows carry the reconciliation flags (`created`,
//! `updated`, `reconcile_metrics`) that chain the pipeline stages together:
//! a stage flips a flag, the next stage's resync scan picks it up.
//!
//! Two backends are provided. [`MemoryStore`] keeps everything in process
//! memory and backs the test suites; [`PostgresStore`] (behind the
//! `postgres` feature) is the production backend.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", deny(missing_docs))]
#![cfg_attr(feature = "strict-docs", deny(rustdoc::broken_intra_doc_links))]

pub mod error;
pub mod memory;
pub mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::{
    ExperimentRecord, MetricKind, MetricRecord, NewExperiment, NewMetric, NewRun, RunRecord,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use traits::{ExperimentStore, MetricStore, MirrorStore, RunStore};
