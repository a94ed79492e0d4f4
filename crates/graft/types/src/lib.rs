//! Shared domain types for the graft reconciliation pipeline.
//!
//! These are the entities the tracking servers speak: experiments, runs with
//! their params/tags/metric samples, and artifact listings. Timestamps arrive
//! as raw epoch integers on the wire (milliseconds for experiments and runs,
//! seconds for metric samples); the conversion helpers here are the single
//! place that convention lives.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod artifact;
mod experiment;
mod metric;
mod run;

pub use artifact::Artifact;
pub use experiment::{Experiment, ExperimentTag};
pub use metric::MetricSample;
pub use run::{Run, RunData, RunInfo, RunParam, RunStatus, RunTag};
