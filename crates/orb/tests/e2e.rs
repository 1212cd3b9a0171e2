//! End-to-end scenarios over real loopback TCP: a call through a full
//! client and server stack, concurrent callers sharing one target,
//! reconnection after a dropped connection, an orphaned call whose late
//! reply must be silently discarded, and the binding-name cache's lease
//! and cookie-invalidation behavior.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use orb::{
  handshake, AcceptorConfig, BindingCache, ClientTuning, CmdItemPool, CmdState, Lookup, ObjectHandler, ObjectId, ObjectLocator, ObjectRegistry, OrbError, ServerTarget,
  WireAcceptor, WorkerPool,
};

struct Echo;
impl ObjectHandler for Echo {
  fn dispatch(&self, payload: &[u8]) -> Result<Vec<u8>, OrbError> {
    Ok(payload.to_vec())
  }
}

struct SlowEcho {
  delay: Duration,
}
impl ObjectHandler for SlowEcho {
  fn dispatch(&self, payload: &[u8]) -> Result<Vec<u8>, OrbError> {
    thread::sleep(self.delay);
    Ok(payload.to_vec())
  }
}

fn spawn_server(registry: Arc<ObjectRegistry>) -> String {
  let pool = Arc::new(WorkerPool::new(registry));
  let acceptor = WireAcceptor::bind("127.0.0.1:0", AcceptorConfig::default()).unwrap();
  let addr = format!("127.0.0.1:{}", acceptor.local_addr().unwrap().port());
  thread::spawn(move || acceptor.serve(pool));
  addr
}

fn call(target: &Arc<ServerTarget>, pool: &Arc<CmdItemPool>, object_id: ObjectId, body: &[u8]) -> Result<Vec<u8>, OrbError> {
  let (item, rx) = pool.reserve(32 + body.len())?;
  item.with_output(|buf| {
    buf.extend_from_slice(&object_id.interface_hash().to_le_bytes());
    buf.extend_from_slice(&object_id.instance_hash().to_le_bytes());
    buf.extend_from_slice(body);
  });
  let outcome = match target.queue(item.clone()) {
    Ok(_) => rx.recv().unwrap_or_else(|_| Err(OrbError::Internal("waiter dropped".into()))),
    Err(e) => Err(e),
  };
  pool.release(&item);
  outcome
}

fn fast_tuning() -> ClientTuning {
  let mut tuning = ClientTuning::default();
  tuning.spooler_cycle = Duration::from_millis(10);
  tuning.connect_timeout = Duration::from_millis(500);
  tuning.handshake_timeout = Duration::from_millis(500);
  tuning
}

#[test]
fn nil_call_smoke_leaves_no_reserved_items_after_fifty_thousand_calls() {
  let registry = Arc::new(ObjectRegistry::new());
  let object_id = ObjectId::new(1, 1);
  registry.register(object_id, Arc::new(Echo)).unwrap();
  let addr = spawn_server(registry);

  let pool = Arc::new(CmdItemPool::new());
  let (target, _handle) = ServerTarget::connect(addr, pool.clone(), fast_tuning(), None).unwrap();

  for _ in 0..50_000 {
    let reply = call(&target, &pool, object_id, &[]).unwrap();
    assert!(reply.is_empty());
  }
  assert_eq!(pool.reserved_count(), 0, "every reserved CmdItem must be released back to the pool");
  target.request_shutdown();
}

#[test]
fn concurrent_callers_share_one_target_without_cross_talk() {
  let registry = Arc::new(ObjectRegistry::new());
  let object_id = ObjectId::new(2, 2);
  registry.register(object_id, Arc::new(Echo)).unwrap();
  let addr = spawn_server(registry);

  let pool = Arc::new(CmdItemPool::with_cap(64));
  let (target, _handle) = ServerTarget::connect(addr, pool.clone(), fast_tuning(), None).unwrap();

  let successes = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();
  for worker in 0..8u8 {
    let target = target.clone();
    let pool = pool.clone();
    let successes = successes.clone();
    handles.push(thread::spawn(move || {
      for i in 0..100u32 {
        let body = [worker, (i & 0xFF) as u8];
        let reply = call(&target, &pool, object_id, &body).unwrap();
        assert_eq!(reply, body);
        successes.fetch_add(1, Ordering::SeqCst);
      }
    }));
  }
  for h in handles {
    h.join().unwrap();
  }
  assert_eq!(successes.load(Ordering::SeqCst), 800);
  assert_eq!(pool.reserved_count(), 0);
  target.request_shutdown();
}

#[test]
fn target_reconnects_after_the_connection_is_dropped() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
  let server = thread::spawn(move || {
    let (first, _) = listener.accept().unwrap();
    handshake::send(&first, handshake::ACCEPTED).unwrap();
    drop(first); // immediately sever the first connection

    let (second, _) = listener.accept().unwrap();
    handshake::send(&second, handshake::ACCEPTED).unwrap();
    thread::sleep(Duration::from_secs(2));
  });

  let pool = Arc::new(CmdItemPool::new());
  let (target, _handle) = ServerTarget::connect(addr, pool, fast_tuning(), None).unwrap();
  assert!(target.is_connected());

  let deadline = Instant::now() + Duration::from_secs(3);
  while target.is_connected() && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(10));
  }
  assert!(!target.is_connected(), "target should have noticed the dropped connection");

  let deadline = Instant::now() + Duration::from_secs(3);
  while !target.is_connected() && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(10));
  }
  assert!(target.is_connected(), "target should have reconnected to the second accept");

  target.request_shutdown();
  let _ = server.join();
}

#[test]
fn orphaned_call_reply_is_discarded_without_waking_the_dropped_waiter() {
  let registry = Arc::new(ObjectRegistry::new());
  let object_id = ObjectId::new(3, 3);
  registry.register(object_id, Arc::new(SlowEcho { delay: Duration::from_millis(200) })).unwrap();
  let addr = spawn_server(registry);

  let pool = Arc::new(CmdItemPool::new());
  let (target, _handle) = ServerTarget::connect(addr, pool.clone(), fast_tuning(), None).unwrap();

  let (item, rx) = pool.reserve(32).unwrap();
  item.with_output(|buf| {
    buf.extend_from_slice(&object_id.interface_hash().to_le_bytes());
    buf.extend_from_slice(&object_id.instance_hash().to_le_bytes());
  });
  target.queue(item.clone()).unwrap();

  let deadline = Instant::now() + Duration::from_millis(500);
  while item.state() != CmdState::ReplyList && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(item.state(), CmdState::ReplyList, "the call must be in flight before we give up on it");

  pool.release(&item); // the caller gives up, e.g. its own deadline elapsed
  assert_eq!(item.state(), CmdState::Orphaned);

  // Give the slow handler's reply time to arrive and be discarded.
  thread::sleep(Duration::from_millis(500));
  assert_eq!(item.state(), CmdState::Free);
  assert_eq!(pool.reserved_count(), 0);
  assert!(rx.recv().is_err(), "no outcome should ever be sent for an orphaned item");

  target.request_shutdown();
}

#[test]
fn binding_cache_serves_fresh_entries_and_flushes_on_cookie_mismatch() {
  let tuning = ClientTuning::default();
  let cache = BindingCache::new(&tuning);
  let locator = ObjectLocator::new(ObjectId::new(9, 9), "svc.internal", 7000, "default");

  cache.store("orders-service", locator.clone());
  assert!(matches!(cache.lookup("orders-service"), Lookup::Fresh(_)));

  // A name-server cookie flip (the object moved or was re-registered)
  // must flush the whole cache regardless of how fresh any entry's
  // lease is.
  assert!(cache.note_cookie(43));
  assert!(matches!(cache.lookup("orders-service"), Lookup::Expired));

  cache.store("orders-service", locator);
  assert!(!cache.note_cookie(43), "matching cookie must not flush again");
}
