//! Clients for the experiment-tracking servers graft reconciles between.
//!
//! The sync pipeline reads from the workspace-local server and pushes to
//! the cluster-wide platform server through the same [`TrackingStore`]
//! trait, so reconcilers never care which side they are talking to.
//! [`HttpTrackingStore`] speaks the tracking servers' HTTP dialect;
//! [`MemoryTrackingStore`] is a seedable in-process stand-in for tests.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", deny(missing_docs))]
#![cfg_attr(feature = "strict-docs", deny(rustdoc::broken_intra_doc_links))]

pub mod error;
pub mod http;
pub mod memory;
pub mod store;

pub use error::{TrackingError, TrackingResult};
pub use http::HttpTrackingStore;
pub use memory::MemoryTrackingStore;
pub use store::{TrackingPair, TrackingStore};
