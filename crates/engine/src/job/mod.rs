//! Job wrappers used while a submitted job is in flight.
//!
//! - `standard`: flattens a job and its tail graph into independently dispatchable jobs
//! - `graph`: tracks which of those jobs may run and merges their results
//! - `watched`: the retry unit of one graph node, split on partial failure
//! - `hints`: cache hint rewriting for jobs that were split apart

pub mod graph;
pub mod hints;
pub mod standard;
pub mod watched;

pub use graph::{JobGraph, ReadyJob};
pub use hints::adjust_cache_hints;
pub use standard::{FlatJob, StandardJob};
pub use watched::{split_job, WatchedJob};
