//! Node-local workload cache.
//!
//! Maps workload identity to its metadata and, once known, an owned handle
//! on its network namespace. This is the state replayed to every newly
//! connected dataplane instance.

mod workload;

pub use workload::{CachedWorkload, WorkloadCache, WorkloadSnapshot};
