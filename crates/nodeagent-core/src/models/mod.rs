//! Data models shared by the agent's components and its ingress surface.

mod workload;

pub use workload::*;
