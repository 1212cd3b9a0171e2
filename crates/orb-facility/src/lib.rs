//! # FACILITY
//! **Based on spec §4.10**
//!
//! Ties configuration, one-shot bootstrap, and the background monitor
//! together into the surface an embedding process actually calls.

mod bootstrap;
mod config;
mod monitor;

pub use bootstrap::{client_runtime, init_client, init_server, server_runtime, terminate, ClientRuntime, ServerRuntime};
pub use config::Config;
pub use monitor::{spawn_monitor, MonitorHandle, DEFAULT_INTERVAL};
