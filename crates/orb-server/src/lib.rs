//! # SERVER RUNTIME
//! **Based on spec §4.6–4.9**
//!
//! The listening side of the ORB: a [WireAcceptor] admits connections
//! behind a connection-count cap and an optional address filter, each
//! admitted connection is driven by [run_connection], and calls land in
//! a shared [WorkerPool] that dispatches into an [ObjectRegistry].

mod acceptor;
mod connection;
mod registry;
mod workpool;

pub use acceptor::{AcceptorConfig, WireAcceptor, MAX_CONNECTION_CAP};
pub use connection::{run_connection, Connection};
pub use registry::{ObjectHandler, ObjectRegistry};
pub use workpool::{WorkItem, WorkerPool, DEFAULT_BASELINE, DEFAULT_CAP};
