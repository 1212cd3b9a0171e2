//! # BOOTSTRAP
//! **Based on spec §4.10**
//!
//! `init_client` and `init_server` are independently idempotent: a
//! process may call either, both, or neither, and a second call to one
//! after it has already run just hands back the runtime the first call
//! built. `terminate` shuts down whichever runtimes are live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use orb_client::ClientRegistry;
use orb_cmditem::CmdItemPool;
use orb_server::{ObjectRegistry, WorkerPool};

use crate::config::Config;

/// ## CLIENT RUNTIME
pub struct ClientRuntime {
  pub pool: Arc<CmdItemPool>,
  pub registry: Arc<ClientRegistry>,
}

/// ## SERVER RUNTIME
pub struct ServerRuntime {
  pub registry: Arc<ObjectRegistry>,
  pub pool: Arc<WorkerPool>,
}

static CLIENT_RUNTIME: OnceLock<ClientRuntime> = OnceLock::new();
static SERVER_RUNTIME: OnceLock<ServerRuntime> = OnceLock::new();
static TERMINATED: AtomicBool = AtomicBool::new(false);

/// ### INIT CLIENT
///
/// Builds the process-wide client runtime (command-item pool and
/// registry) on first call; later calls return the same runtime,
/// ignoring `config` (the first caller's configuration wins, matching
/// the one-shot-flag idiom spec §4.10 describes).
pub fn init_client(config: &Config) -> &'static ClientRuntime {
  CLIENT_RUNTIME.get_or_init(|| {
    let pool = Arc::new(CmdItemPool::new());
    let (registry, _scavenger_handle) = ClientRegistry::start(pool.clone(), config.client_tuning, None);
    tracing::info!("client runtime initialized");
    ClientRuntime { pool, registry }
  })
}

/// ### INIT SERVER
pub fn init_server(config: &Config) -> &'static ServerRuntime {
  SERVER_RUNTIME.get_or_init(|| {
    let registry = Arc::new(ObjectRegistry::new());
    let pool = Arc::new(WorkerPool::with_bounds(registry.clone(), config.worker_baseline, config.worker_cap));
    tracing::info!("server runtime initialized");
    ServerRuntime { registry, pool }
  })
}

pub fn client_runtime() -> Option<&'static ClientRuntime> {
  CLIENT_RUNTIME.get()
}

pub fn server_runtime() -> Option<&'static ServerRuntime> {
  SERVER_RUNTIME.get()
}

/// ### TERMINATE
///
/// Shuts down every live `ServerTarget` the client runtime knows about.
/// The server runtime has no sockets of its own to close here; the
/// `WireAcceptor` that owns the listening socket is dropped by its
/// caller; this only stops asking it to do more work.
pub fn terminate() {
  if TERMINATED.swap(true, Ordering::SeqCst) {
    return;
  }
  if let Some(runtime) = CLIENT_RUNTIME.get() {
    runtime.registry.shutdown_all();
  }
  tracing::info!("orb facility terminated");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn init_client_is_idempotent() {
    let config = Config::default();
    let a = init_client(&config) as *const ClientRuntime;
    let b = init_client(&config) as *const ClientRuntime;
    assert_eq!(a, b);
  }
}
