//! Generic reconciliation engine.
//!
//! The engine is three small pieces:
//! - [`ReconcileQueue`]: a deduplicating work queue with three key states
//!   (pending, running, scheduled-for-retry) and jittered retry backoff;
//! - [`Reconciler`]: the per-entity-kind contract of `name`, `reboot`,
//!   `resync`, and `reconcile`;
//! - [`Manager`]: owns one queue and one reconciler, runs the periodic
//!   resync scan plus a fixed pool of workers popping bounded batches.
//!
//! Keys move between queue states only through `add`, `pop`, and item
//! completion, so a key is never reconciled by two workers at once. The
//! engine never orders keys: scans repopulate the queue, dedup collapses
//! repeats, and failed keys come back after a randomized backoff.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
mod manager;
mod queue;
mod reconciler;

pub use error::{ReconcileError, ReconcileResult};
pub use manager::{Manager, ManagerConfig};
pub use queue::{ReconcileItem, ReconcileKey, ReconcileQueue};
pub use reconciler::{BoxError, Reconciler};
