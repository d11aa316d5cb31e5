//! Local event ingress.
//!
//! The platform event source (and the `nodeagent ctl` subcommands) drive the
//! agent over a Unix stream socket speaking length-prefixed JSON-RPC 2.0.
//!
//! # Architecture
//!
//! - **Server**: accepts connections and dispatches method calls to an [`IngressDispatch`]
//! - **Dispatch**: maps `add_workload`, `remove_workload`, `list_workloads` and `status`
//!   onto the orchestrator
//! - **Client**: typed calls for tooling and tests
//! - **Protocol**: framing and JSON-RPC types shared by both ends

mod client;
mod dispatch;
mod protocol;
mod server;

pub use client::IngressClient;
pub use dispatch::{WorkloadParams, METHODS};
pub use protocol::{read_frame, write_frame, RpcError, RpcRequest, RpcResponse};
pub use server::{IngressDispatch, IngressServer, IngressServerHandle};
