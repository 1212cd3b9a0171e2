//! # WORK QUEUE AND WORKER POOL
//! **Based on spec §4.8**
//!
//! Per-connection reader tasks hand decoded calls to a single shared
//! queue; an elastic pool of worker threads drains it and dispatches
//! into the [ObjectRegistry]. The pool starts at 4 workers and grows
//! (one at a time, up to a cap of 128) when the backlog outgrows the
//! current worker count. Workers are never retired for the process
//! lifetime, baseline or otherwise.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use orb_ids::ObjectId;

use crate::connection::Connection;
use crate::registry::ObjectRegistry;

/// Default initial worker count (spec §4.8).
pub const DEFAULT_BASELINE: usize = 4;
/// Default worker cap (spec §4.8).
pub const DEFAULT_CAP: usize = 128;

/// One decoded call, ready for dispatch.
pub struct WorkItem {
  pub connection: Arc<Connection>,
  pub sequence_id: u32,
  pub object_id: ObjectId,
  pub body: Vec<u8>,
}

/// ## WORKER POOL
/// See the module documentation.
pub struct WorkerPool {
  sender: mpsc::Sender<WorkItem>,
  receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
  registry: Arc<ObjectRegistry>,
  worker_count: Arc<AtomicUsize>,
  pending: Arc<AtomicUsize>,
  baseline: usize,
  cap: usize,
}

impl WorkerPool {
  pub fn new(registry: Arc<ObjectRegistry>) -> Self {
    Self::with_bounds(registry, DEFAULT_BASELINE, DEFAULT_CAP)
  }

  pub fn with_bounds(registry: Arc<ObjectRegistry>, baseline: usize, cap: usize) -> Self {
    let (sender, receiver) = mpsc::channel();
    let pool = Self {
      sender,
      receiver: Arc::new(Mutex::new(receiver)),
      registry,
      worker_count: Arc::new(AtomicUsize::new(0)),
      pending: Arc::new(AtomicUsize::new(0)),
      baseline,
      cap,
    };
    for _ in 0..baseline {
      pool.spawn_worker();
    }
    pool
  }

  fn spawn_worker(&self) {
    self.worker_count.fetch_add(1, Ordering::SeqCst);
    let receiver = self.receiver.clone();
    let registry = self.registry.clone();
    let pending = self.pending.clone();

    thread::spawn(move || loop {
      let received = {
        let rx = receiver.lock().unwrap();
        rx.recv()
      };
      match received {
        Ok(item) => {
          pending.fetch_sub(1, Ordering::SeqCst);
          dispatch_and_reply(&registry, item);
        }
        Err(_) => return,
      }
    });
  }

  /// ### SUBMIT
  ///
  /// Enqueues a decoded call. If the backlog now exceeds twice the
  /// current worker count and the pool is below its cap, one additional
  /// worker is spawned to help drain it. Once spawned, a worker runs for
  /// the process lifetime; the pool only ever grows.
  pub fn submit(&self, item: WorkItem) {
    let backlog = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
    let workers = self.worker_count.load(Ordering::SeqCst);
    if backlog > workers.saturating_mul(2) && workers < self.cap {
      self.spawn_worker();
    }
    let _ = self.sender.send(item);
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count.load(Ordering::SeqCst)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }
}

fn dispatch_and_reply(registry: &ObjectRegistry, item: WorkItem) {
  let result = registry.dispatch(item.object_id, &item.body);
  match result {
    Ok(reply) => item.connection.reply(item.sequence_id, &reply),
    Err(error) => {
      tracing::debug!(sequence_id = item.sequence_id, %error, "dispatch failed");
      item.connection.reply_error(item.sequence_id, &error);
    }
  }
}
