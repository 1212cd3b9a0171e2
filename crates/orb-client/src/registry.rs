//! # CLIENT REGISTRY AND SCAVENGER
//! **Based on spec §4.4**
//!
//! The global table of live [ServerTarget]s, keyed by endpoint, shared
//! by every proxy in the process. A target with no remaining references
//! is not destroyed immediately; it is moved to a scavenger list and
//! kept alive for [ClientTuning::scavenger_retain] in case a new proxy
//! addresses the same endpoint again shortly after.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use orb_cmditem::CmdItemPool;
use orb_error::OrbError;
use orb_wire::Encrypter;

use crate::target::ServerTarget;
use crate::tuning::ClientTuning;

struct Entry {
  target: Arc<ServerTarget>,
  handle: JoinHandle<()>,
}

struct ScavengerEntry {
  target: Arc<ServerTarget>,
  handle: JoinHandle<()>,
  expiry: Instant,
}

/// ## CLIENT REGISTRY
/// See the module documentation.
pub struct ClientRegistry {
  pool: Arc<CmdItemPool>,
  tuning: ClientTuning,
  encrypter: Option<Arc<dyn Encrypter>>,
  active: Mutex<HashMap<String, Entry>>,
  scavenger: Mutex<HashMap<String, ScavengerEntry>>,
  connect_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<Result<(), OrbError>>>>>,
  shutdown: AtomicBool,
}

impl ClientRegistry {
  /// Constructs the registry and starts its background scavenger
  /// thread. Mirrors `ServerTarget::connect`'s shape of returning both
  /// the shared handle and the thread's [JoinHandle].
  pub fn start(pool: Arc<CmdItemPool>, tuning: ClientTuning, encrypter: Option<Arc<dyn Encrypter>>) -> (Arc<Self>, JoinHandle<()>) {
    let registry = Arc::new(Self {
      pool,
      tuning,
      encrypter,
      active: Mutex::new(HashMap::new()),
      scavenger: Mutex::new(HashMap::new()),
      connect_waiters: Mutex::new(HashMap::new()),
      shutdown: AtomicBool::new(false),
    });
    let scavenger_registry = registry.clone();
    let handle = thread::spawn(move || {
      while !scavenger_registry.shutdown.load(Ordering::SeqCst) {
        thread::sleep(scavenger_registry.tuning.scavenger_interval);
        scavenger_registry.sweep_scavenger();
      }
    });
    (registry, handle)
  }

  /// ### ACQUIRE
  /// **Based on spec §4.4's Acquire protocol**
  ///
  /// Returns a referenced [ServerTarget] for `endpoint`, reusing an
  /// active or recently-scavenged target if one exists, otherwise
  /// connecting a new one. Concurrent `acquire` calls for the same
  /// endpoint that race a connect share the single in-flight attempt
  /// rather than each dialing independently.
  pub fn acquire(self: &Arc<Self>, endpoint: &str) -> Result<Arc<ServerTarget>, OrbError> {
    loop {
      if let Some(target) = self.take_active(endpoint) {
        return Ok(target);
      }
      if let Some(target) = self.revive_scavenged(endpoint) {
        return Ok(target);
      }

      let rx = {
        let mut waiters = self.connect_waiters.lock().unwrap();
        if let Some(list) = waiters.get_mut(endpoint) {
          let (tx, rx) = oneshot::channel();
          list.push(tx);
          Some(rx)
        } else {
          waiters.insert(endpoint.to_string(), Vec::new());
          None
        }
      };

      match rx {
        Some(rx) => match rx.recv_timeout(self.tuning.connect_waiter_timeout) {
          Ok(Ok(())) => continue, // the connector finished; retry from the top
          Ok(Err(e)) => return Err(e),
          Err(_) => return Err(OrbError::Timeout(self.tuning.connect_waiter_timeout)),
        },
        None => return self.connect_and_publish(endpoint),
      }
    }
  }

  fn take_active(&self, endpoint: &str) -> Option<Arc<ServerTarget>> {
    let active = self.active.lock().unwrap();
    active.get(endpoint).map(|entry| {
      entry.target.incref();
      entry.target.clone()
    })
  }

  fn revive_scavenged(&self, endpoint: &str) -> Option<Arc<ServerTarget>> {
    let entry = self.scavenger.lock().unwrap().remove(endpoint)?;
    entry.target.incref();
    let target = entry.target.clone();
    self.active.lock().unwrap().insert(endpoint.to_string(), Entry { target: entry.target, handle: entry.handle });
    Some(target)
  }

  /// Called by whichever `acquire` caller won the race to connect.
  /// Performs the connect outside any registry lock, then wakes every
  /// other caller that queued up behind it.
  fn connect_and_publish(self: &Arc<Self>, endpoint: &str) -> Result<Arc<ServerTarget>, OrbError> {
    let result = ServerTarget::connect(endpoint.to_string(), self.pool.clone(), self.tuning, self.encrypter.clone());
    let waiters = self.connect_waiters.lock().unwrap().remove(endpoint).unwrap_or_default();

    match result {
      Ok((target, handle)) => {
        self.active.lock().unwrap().insert(endpoint.to_string(), Entry { target: target.clone(), handle });
        for waiter in waiters {
          let _ = waiter.send(Ok(()));
        }
        Ok(target)
      }
      Err(error) => {
        for waiter in waiters {
          let _ = waiter.send(Err(error.clone()));
        }
        Err(error)
      }
    }
  }

  /// ### RELEASE
  /// **Based on spec §4.4's Release protocol**
  ///
  /// Decrements the target's refcount; if it reaches zero, the target
  /// moves from `active` to the scavenger list rather than being
  /// destroyed immediately. The decrement and the membership change
  /// happen under the same `active` lock so a concurrent `acquire`
  /// cannot observe a target mid-eviction.
  pub fn release(&self, target: &Arc<ServerTarget>) {
    let mut active = self.active.lock().unwrap();
    let remaining = target.decref();
    if remaining == 0 {
      if let Some(entry) = active.remove(target.endpoint()) {
        drop(active);
        let expiry = Instant::now() + self.tuning.scavenger_retain;
        self.scavenger.lock().unwrap().insert(entry.target.endpoint().to_string(), ScavengerEntry { target: entry.target, handle: entry.handle, expiry });
      }
    }
  }

  fn sweep_scavenger(&self) {
    let now = Instant::now();
    let mut scavenger = self.scavenger.lock().unwrap();
    let expired: Vec<String> = scavenger.iter().filter(|(_, e)| now >= e.expiry).map(|(k, _)| k.clone()).collect();
    for key in expired {
      if let Some(entry) = scavenger.remove(&key) {
        entry.target.request_shutdown();
        tracing::info!(endpoint = %key, "scavenged idle server target");
      }
    }
  }

  pub fn active_count(&self) -> usize {
    self.active.lock().unwrap().len()
  }

  pub fn scavenger_count(&self) -> usize {
    self.scavenger.lock().unwrap().len()
  }

  /// Shuts down every known target (active and scavenged) and stops the
  /// scavenger loop. Used by `orb-facility`'s `Terminate`.
  pub fn shutdown_all(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
    for (_, entry) in self.active.lock().unwrap().drain() {
      entry.target.request_shutdown();
    }
    for (_, entry) in self.scavenger.lock().unwrap().drain() {
      entry.target.request_shutdown();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use orb_wire::handshake as hs;
  use std::net::TcpListener;
  use std::time::Duration;

  fn spawn_accepting_server() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let handle = thread::spawn(move || {
      for stream in listener.incoming().take(4) {
        if let Ok(stream) = stream {
          let _ = hs::send(&stream, hs::ACCEPTED);
          thread::sleep(Duration::from_secs(30));
        }
      }
    });
    (addr, handle)
  }

  #[test]
  fn repeated_acquire_reuses_the_same_target() {
    let (endpoint, _server) = spawn_accepting_server();
    let pool = Arc::new(CmdItemPool::new());
    let (registry, _sh) = ClientRegistry::start(pool, ClientTuning::default(), None);
    let a = registry.acquire(&endpoint).unwrap();
    let b = registry.acquire(&endpoint).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.refcount(), 2);
    registry.release(&a);
    registry.release(&b);
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.scavenger_count(), 1);
  }

  #[test]
  fn scavenged_target_is_revived_on_reacquire() {
    let (endpoint, _server) = spawn_accepting_server();
    let pool = Arc::new(CmdItemPool::new());
    let (registry, _sh) = ClientRegistry::start(pool, ClientTuning::default(), None);
    let a = registry.acquire(&endpoint).unwrap();
    registry.release(&a);
    assert_eq!(registry.scavenger_count(), 1);
    let b = registry.acquire(&endpoint).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.scavenger_count(), 0);
    registry.release(&b);
  }

  #[test]
  fn concurrent_acquire_for_same_endpoint_shares_one_connect() {
    let (endpoint, _server) = spawn_accepting_server();
    let pool = Arc::new(CmdItemPool::new());
    let (registry, _sh) = ClientRegistry::start(pool, ClientTuning::default(), None);
    let mut handles = Vec::new();
    for _ in 0..3 {
      let registry = registry.clone();
      let endpoint = endpoint.clone();
      handles.push(thread::spawn(move || registry.acquire(&endpoint).unwrap()));
    }
    let targets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for t in &targets {
      assert!(Arc::ptr_eq(t, &targets[0]));
    }
    assert_eq!(targets[0].refcount(), 3);
  }
}
