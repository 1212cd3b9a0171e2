//! # MONITOR
//! **Based on spec §4.10**
//!
//! Emits a periodic `tracing::info!` snapshot of whichever runtimes are
//! live: active/scavenged target counts and reserved command items on
//! the client side, worker and backlog counts and registered-object
//! count on the server side. Any embedder subscribes with its own
//! `tracing_subscriber` layer; this crate implements no sink of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bootstrap::{client_runtime, server_runtime};

/// Default interval between monitor snapshots.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// ### SPAWN MONITOR
///
/// Starts the monitor thread, returning a handle that can stop it by
/// calling [MonitorHandle::stop] (or simply dropping it, which leaves
/// the thread running until process exit, matching a daemon-style
/// background task).
pub fn spawn_monitor(interval: Duration) -> MonitorHandle {
  let stop = Arc::new(AtomicBool::new(false));
  let thread_stop = stop.clone();
  let handle = thread::spawn(move || {
    while !thread_stop.load(Ordering::SeqCst) {
      thread::sleep(interval);
      tick();
    }
  });
  MonitorHandle { stop, handle: Some(handle) }
}

fn tick() {
  if let Some(client) = client_runtime() {
    tracing::info!(
      active_targets = client.registry.active_count(),
      scavenged_targets = client.registry.scavenger_count(),
      reserved_cmd_items = client.pool.reserved_count(),
      "client monitor tick"
    );
  }
  if let Some(server) = server_runtime() {
    tracing::info!(
      worker_count = server.pool.worker_count(),
      pending_work = server.pool.pending_count(),
      registered_objects = server.registry.len(),
      "server monitor tick"
    );
  }
}

/// ## MONITOR HANDLE
pub struct MonitorHandle {
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
  pub fn stop(mut self) {
    self.stop.store(true, Ordering::SeqCst);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
