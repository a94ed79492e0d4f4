//! The three-stage pipeline keeping a mirror store and two tracking
//! servers in agreement.
//!
//! Each stage is a [`graft_reconcile::Reconciler`] and the stages chain
//! through flags on the mirror rows rather than through channels:
//!
//! 1. [`ExperimentReconciler`] discovers experiments on the local server,
//!    mirrors them, and materializes them on the platform server.
//! 2. [`RunReconciler`] picks up flagged experiments, pushes their runs to
//!    the platform, and flags runs whose metrics changed.
//! 3. [`MetricsReconciler`] picks up flagged runs and folds the platform's
//!    metric history and artifacts into the mirror.
//!
//! [`ReconcilerSet`] wires all three to managers and drives them as one
//! unit.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", deny(missing_docs))]
#![cfg_attr(feature = "strict-docs", deny(rustdoc::broken_intra_doc_links))]

pub mod config;
pub mod experiments;
pub mod metrics;
pub mod runs;
pub mod set;

pub use config::SyncConfig;
pub use experiments::ExperimentReconciler;
pub use metrics::MetricsReconciler;
pub use runs::RunReconciler;
pub use set::ReconcilerSet;
