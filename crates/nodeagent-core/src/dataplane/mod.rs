//! Dataplane control protocol.
//!
//! The dataplane process connects to the agent over a local seqpacket socket,
//! says hello, receives a replay of every known workload, and from then on is
//! told about adds and deletes one acknowledged request at a time.

mod connection;
mod manager;
mod protocol;
mod server;
pub mod socket;

pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionState, DataplaneConnection, UpdateRequest,
};
pub use manager::ConnectionManager;
pub use protocol::{Ack, DataplaneHello, DataplaneWire, Incoming, WorkloadRequest, WorkloadResponse};
pub use server::DataplaneServer;
pub use socket::{Datagram, SeqPacketListener, SeqPacketStream};
