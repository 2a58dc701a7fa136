//! statpool - distributed mean and exact median
//!
//! A coordinator splits a stream of numbers across a pool of workers and then
//! answers statistic requests over the whole data set without collecting it:
//!
//! - **Mean**: count-weighted combination of per-worker averages
//! - **Exact median**: bisection over the value domain driven by per-worker
//!   counts below and above a pivot, finished by a bracket lookup
//!
//! Workers talk to the coordinator over three channels (broadcast, work
//! distribution, result aggregation), either over TCP or in-process.

pub mod config;
pub mod distributed;
pub mod stats;

// Re-export commonly used types
pub use config::Config;
pub use distributed::{Coordinator, NodeService, RoundError, Worker};

/// Result type used throughout statpool
pub type Result<T> = anyhow::Result<T>;
