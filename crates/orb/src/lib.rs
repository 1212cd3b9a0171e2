//! # ORB
//!
//! A bidirectional, framed binary RPC runtime over TCP: connection
//! multiplexing, out-of-order reply correlation, keep-alive and
//! reconnection on the client side, an elastic worker pool and a fixed
//! object registry on the server side. This crate re-exports the public
//! surface of the lower-level `orb-*` crates so an embedder depends on
//! one crate instead of seven.
//!
//! See `orb_facility::init_client` / `orb_facility::init_server` to
//! bring up a process-wide runtime, and the [prelude] module for the
//! common set of imports a proxy or stub reaches for.

pub use orb_error::OrbError;

pub use orb_ids::{Digest128, ObjectId, ObjectLocator, SequenceId, BUCKET_COUNT, KEEP_ALIVE_SEQUENCE_ID};

pub use orb_wire::{handshake, payload_hash, read_frame, write_data_frame, write_keep_alive, Encrypter, Frame, WireError, HEADER_LEN, MAX_PAYLOAD};

pub use orb_cmditem::{CmdItem, CmdItemPool, CmdOutcome, CmdState, DEFAULT_POOL_CAP};

pub use orb_client::{BindingCache, ClientRegistry, ClientTuning, Lookup, ServerTarget, NAME_SERVER_BINDING};

pub use orb_server::{run_connection, AcceptorConfig, Connection, ObjectHandler, ObjectRegistry, WireAcceptor, WorkItem, WorkerPool, DEFAULT_BASELINE, DEFAULT_CAP, MAX_CONNECTION_CAP};

pub use orb_facility::{client_runtime, init_client, init_server, server_runtime, spawn_monitor, terminate, ClientRuntime, Config, MonitorHandle, ServerRuntime};

/// The common imports a generated proxy or stub reaches for.
pub mod prelude {
  pub use crate::{CmdItem, CmdItemPool, CmdOutcome, ObjectId, ObjectLocator, ObjectRegistry, OrbError, SequenceId, ServerTarget};
}
