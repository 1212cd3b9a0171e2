//! # SERVER TARGET AND SPOOLER
//! **Based on spec §4.3**
//!
//! A [ServerTarget] is the client-side connection to one remote
//! endpoint, shared by every proxy that addresses it. Its spooler thread
//! is the only thread that ever touches the socket, which is what
//! serializes outbound frames without a second writer thread.

use std::collections::{HashMap, VecDeque};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use orb_cmditem::{CmdItem, CmdItemPool};
use orb_error::OrbError;
use orb_ids::SequenceId;
use orb_wire::{handshake, Encrypter, Frame};

use crate::tuning::ClientTuning;

enum ConnState {
  Reconnecting,
  Connected(TcpStream),
}

/// ## SERVER TARGET
/// See the module documentation.
pub struct ServerTarget {
  endpoint: String,
  pool: Arc<CmdItemPool>,
  tuning: ClientTuning,
  encrypter: Option<Arc<dyn Encrypter>>,
  state: RwLock<ConnState>,
  outbound: Mutex<VecDeque<Arc<CmdItem>>>,
  next_sequence: Mutex<u64>,
  reply_list: Mutex<HashMap<u32, Arc<CmdItem>>>,
  refcount: AtomicUsize,
  shutdown: AtomicBool,
  next_ping_deadline: Mutex<Instant>,
}

impl ServerTarget {
  fn new_shared(
    endpoint: String,
    pool: Arc<CmdItemPool>,
    tuning: ClientTuning,
    encrypter: Option<Arc<dyn Encrypter>>,
    initial: ConnState,
  ) -> Arc<Self> {
    Arc::new(Self {
      endpoint,
      pool,
      tuning,
      encrypter,
      state: RwLock::new(initial),
      outbound: Mutex::new(VecDeque::new()),
      next_sequence: Mutex::new(1),
      reply_list: Mutex::new(HashMap::new()),
      refcount: AtomicUsize::new(1),
      shutdown: AtomicBool::new(false),
      next_ping_deadline: Mutex::new(Instant::now()),
    })
  }

  /// ### CONNECT
  /// **Based on spec §4.3's handshake and §4.4's "construct and
  /// initialize a new ServerTarget (outside the lock)"**
  ///
  /// Synchronously performs the TCP connect and the 4-byte handshake, so
  /// that the distinct rejection causes in spec §4.3 can be reported to
  /// the caller racing to create this target. On success, starts the
  /// background spooler thread and returns both the target and its
  /// [JoinHandle].
  pub fn connect(
    endpoint: impl Into<String>,
    pool: Arc<CmdItemPool>,
    tuning: ClientTuning,
    encrypter: Option<Arc<dyn Encrypter>>,
  ) -> Result<(Arc<Self>, JoinHandle<()>), OrbError> {
    let endpoint = endpoint.into();
    let addr = endpoint
      .to_socket_addrs()
      .ok()
      .and_then(|mut addrs| addrs.next())
      .ok_or_else(|| OrbError::LostConnection(endpoint.clone()))?;
    let stream = TcpStream::connect_timeout(&addr, tuning.connect_timeout + tuning.timeout_adjust)
      .map_err(|_| OrbError::LostConnection(endpoint.clone()))?;
    let _ = stream.set_nodelay(true);
    match handshake::read(&stream, tuning.handshake_timeout + tuning.timeout_adjust) {
      Ok(handshake::HandshakeCode::Accepted) => {}
      Ok(handshake::HandshakeCode::TooManyClients) => return Err(OrbError::RejectedTooMany),
      Ok(handshake::HandshakeCode::NotBlessed) => return Err(OrbError::RejectedNotBlessed),
      _ => return Err(OrbError::LostConnection(endpoint)),
    }

    let target = Self::new_shared(endpoint, pool, tuning, encrypter, ConnState::Connected(stream));
    *target.next_ping_deadline.lock().unwrap() = Instant::now() + target.tuning.keep_alive_interval;
    let spooler_target = target.clone();
    let handle = thread::spawn(move || spooler_target.run());
    Ok((target, handle))
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// The "still connected" query from spec §7.
  pub fn is_connected(&self) -> bool {
    matches!(*self.state.read().unwrap(), ConnState::Connected(_))
  }

  pub fn incref(&self) -> usize {
    self.refcount.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Returns the refcount after decrementing. Per spec §3's invariant,
  /// underflow is a programming error, not a runtime condition.
  pub fn decref(&self) -> usize {
    let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
    if prev == 0 {
      panic!("ServerTarget refcount underflow for {}", self.endpoint);
    }
    prev - 1
  }

  pub fn refcount(&self) -> usize {
    self.refcount.load(Ordering::SeqCst)
  }

  /// Stops the spooler thread and shuts down the socket. Outstanding
  /// items are aborted by the spooler's own shutdown path once it
  /// observes the flag.
  pub fn request_shutdown(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
    if let ConnState::Connected(stream) = &*self.state.read().unwrap() {
      let _ = stream.shutdown(std::net::Shutdown::Both);
    }
  }

  /// ### QUEUE
  /// **Based on spec §4.3's "Queueing contract"**
  ///
  /// Assigns the next sequence id, marks the item `CmdQ`, and appends it
  /// to the outbound FIFO. Fails fast with [OrbError::LostConnection] if
  /// the target is currently reconnecting.
  pub fn queue(self: &Arc<Self>, item: Arc<CmdItem>) -> Result<SequenceId, OrbError> {
    if !self.is_connected() {
      return Err(OrbError::LostConnection(self.endpoint.clone()));
    }
    let mut outbound = self.outbound.lock().unwrap();
    let mut next_sequence = self.next_sequence.lock().unwrap();
    let sequence_id = SequenceId::new(*next_sequence);
    *next_sequence += 1;
    item.mark_cmdq(sequence_id);
    outbound.push_back(item);
    Ok(sequence_id)
  }

  fn abort_all(&self, items: Vec<Arc<CmdItem>>, error: OrbError) {
    for item in items {
      if !item.abort(error.clone()) {
        self.pool.reclaim(&item);
      }
    }
  }

  fn run(self: Arc<Self>) {
    while !self.shutdown.load(Ordering::SeqCst) {
      if self.is_connected() {
        self.run_connected_cycle();
      } else {
        self.attempt_reconnect();
      }
    }
    self.on_connection_lost();
  }

  /// Background reconnection, entered after the initial [connect]
  /// succeeded and the connection later dropped. Rejection causes are
  /// not distinguished here; only the initial [connect] call needs to
  /// report them, per spec §4.4's Acquire protocol.
  fn attempt_reconnect(&self) {
    let outcome = (|| -> Option<TcpStream> {
      let addr = self.endpoint.to_socket_addrs().ok()?.next()?;
      let stream = TcpStream::connect_timeout(&addr, self.tuning.connect_timeout + self.tuning.timeout_adjust).ok()?;
      let _ = stream.set_nodelay(true);
      match handshake::read(&stream, self.tuning.handshake_timeout + self.tuning.timeout_adjust) {
        Ok(handshake::HandshakeCode::Accepted) => Some(stream),
        _ => None,
      }
    })();

    match outcome {
      Some(stream) => {
        *self.state.write().unwrap() = ConnState::Connected(stream);
        *self.next_ping_deadline.lock().unwrap() = Instant::now() + self.tuning.keep_alive_interval;
        tracing::info!(endpoint = %self.endpoint, "server target reconnected");
      }
      None => {
        let leaked: Vec<_> = self.outbound.lock().unwrap().drain(..).collect();
        if !leaked.is_empty() {
          self.abort_all(leaked, OrbError::LostConnection(self.endpoint.clone()));
        }
        thread::sleep(self.tuning.spooler_cycle);
      }
    }
  }

  fn run_connected_cycle(&self) {
    let frame = {
      let guard = self.state.read().unwrap();
      match &*guard {
        ConnState::Connected(stream) => orb_wire::read_frame(stream, self.tuning.timeout_adjust, self.encrypter.as_deref()),
        ConnState::Reconnecting => return,
      }
    };

    match frame {
      Frame::Packet { sequence_id, payload } => self.on_packet(sequence_id, payload),
      Frame::KeepAlive | Frame::NoPacket => {}
      Frame::Lost => {
        self.on_connection_lost();
        return;
      }
    }

    // Opportunistic + periodic orphan sweep: this runs every cycle
    // regardless of whether a reply arrived, resolving spec §9's third
    // Open Question ("Consider periodic sweeping") without a new thread.
    self.sweep_reply_list();

    if !self.drain_outbound() {
      return;
    }

    self.maybe_send_keep_alive();
  }

  fn on_packet(&self, sequence_id: u32, payload: Vec<u8>) {
    let item = self.reply_list.lock().unwrap().remove(&sequence_id);
    match item {
      Some(item) => {
        if !item.deliver_reply(payload) {
          self.pool.reclaim(&item);
        }
      }
      None => tracing::debug!(sequence_id, endpoint = %self.endpoint, "reply with no matching command item; dropped"),
    }
  }

  fn sweep_reply_list(&self) {
    let mut reply_list = self.reply_list.lock().unwrap();
    let orphaned: Vec<u32> = reply_list.iter().filter(|(_, item)| item.reclaim_if_orphaned()).map(|(seq, _)| *seq).collect();
    for seq in orphaned {
      if let Some(item) = reply_list.remove(&seq) {
        self.pool.reclaim(&item);
      }
    }
  }

  /// Drains the outbound FIFO in order. Returns `false` if the
  /// connection was lost partway through (in which case
  /// [ServerTarget::on_connection_lost] has already run).
  fn drain_outbound(&self) -> bool {
    loop {
      let item = match self.outbound.lock().unwrap().pop_front() {
        Some(item) => item,
        None => return true,
      };
      if item.reclaim_if_orphaned() {
        self.pool.reclaim(&item);
        continue;
      }
      let sequence_id = match item.sequence_id() {
        Some(id) => id,
        None => continue,
      };
      let payload = item.with_output(|buf| buf.clone());
      let sent = {
        let guard = self.state.read().unwrap();
        match &*guard {
          ConnState::Connected(stream) => {
            orb_wire::write_data_frame(stream, sequence_id.wire_value(), &payload, self.tuning.timeout_adjust, self.encrypter.as_deref()).is_ok()
          }
          ConnState::Reconnecting => false,
        }
      };
      if sent {
        item.mark_reply_list();
        self.reply_list.lock().unwrap().insert(sequence_id.wire_value(), item);
        *self.next_ping_deadline.lock().unwrap() = Instant::now() + self.tuning.keep_alive_interval;
      } else {
        if !item.abort(OrbError::LostConnection(self.endpoint.clone())) {
          self.pool.reclaim(&item);
        }
        self.on_connection_lost();
        return false;
      }
    }
  }

  fn maybe_send_keep_alive(&self) {
    let mut deadline = self.next_ping_deadline.lock().unwrap();
    if Instant::now() <= *deadline {
      return;
    }
    let sent = {
      let guard = self.state.read().unwrap();
      match &*guard {
        ConnState::Connected(stream) => orb_wire::write_keep_alive(stream, self.tuning.timeout_adjust).is_ok(),
        ConnState::Reconnecting => false,
      }
    };
    if sent {
      *deadline = Instant::now() + self.tuning.keep_alive_interval;
    } else {
      drop(deadline);
      self.on_connection_lost();
    }
  }

  fn on_connection_lost(&self) {
    let was_connected = {
      let guard = self.state.read().unwrap();
      matches!(&*guard, ConnState::Connected(_))
    };
    if !was_connected {
      return;
    }
    tracing::warn!(endpoint = %self.endpoint, "server target connection lost");
    if let ConnState::Connected(stream) = &*self.state.read().unwrap() {
      let _ = stream.shutdown(std::net::Shutdown::Both);
    }
    *self.state.write().unwrap() = ConnState::Reconnecting;
    let leaked_outbound: Vec<_> = self.outbound.lock().unwrap().drain(..).collect();
    self.abort_all(leaked_outbound, OrbError::LostConnection(self.endpoint.clone()));
    let leaked_replies: Vec<_> = self.reply_list.lock().unwrap().drain().map(|(_, v)| v).collect();
    self.abort_all(leaked_replies, OrbError::LostConnection(self.endpoint.clone()));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use orb_wire::handshake as hs;
  use std::net::TcpListener;
  use std::time::Duration;

  fn accept_and_hold(port_tx: std::sync::mpsc::Sender<u16>) -> JoinHandle<TcpStream> {
    thread::spawn(move || {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      port_tx.send(listener.local_addr().unwrap().port()).unwrap();
      let (stream, _) = listener.accept().unwrap();
      hs::send(&stream, hs::ACCEPTED).unwrap();
      stream
    })
  }

  #[test]
  fn connect_succeeds_on_accepted_handshake_and_queues_items() {
    let (tx, rx) = std::sync::mpsc::channel();
    let server = accept_and_hold(tx);
    let port = rx.recv().unwrap();
    let pool = Arc::new(CmdItemPool::new());
    let mut tuning = ClientTuning::default();
    tuning.spooler_cycle = Duration::from_millis(20);
    let (target, _handle) = ServerTarget::connect(format!("127.0.0.1:{port}"), pool.clone(), tuning, None).unwrap();
    assert!(target.is_connected());
    let (item, _rx) = pool.reserve(0).unwrap();
    item.with_output(|buf| buf.extend_from_slice(b"ping"));
    assert!(target.queue(item).is_ok());
    target.request_shutdown();
    let _ = server.join();
  }

  #[test]
  fn connect_reports_rejection_cause() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      tx.send(listener.local_addr().unwrap().port()).unwrap();
      let (stream, _) = listener.accept().unwrap();
      hs::send(&stream, hs::TOO_MANY_CLIENTS).unwrap();
    });
    let port = rx.recv().unwrap();
    let pool = Arc::new(CmdItemPool::new());
    let result = ServerTarget::connect(format!("127.0.0.1:{port}"), pool, ClientTuning::default(), None);
    assert!(matches!(result, Err(OrbError::RejectedTooMany)));
    let _ = handle.join();
  }

  #[test]
  fn queue_fails_fast_while_reconnecting() {
    let (tx, rx) = std::sync::mpsc::channel();
    let server = accept_and_hold(tx);
    let port = rx.recv().unwrap();
    let pool = Arc::new(CmdItemPool::new());
    let mut tuning = ClientTuning::default();
    tuning.spooler_cycle = Duration::from_millis(10);
    let (target, _handle) = ServerTarget::connect(format!("127.0.0.1:{port}"), pool.clone(), tuning, None).unwrap();
    let stream = server.join().unwrap();
    stream.shutdown(std::net::Shutdown::Both).unwrap();
    // Give the spooler a moment to notice the loss.
    thread::sleep(Duration::from_millis(200));
    let (item, _rx) = pool.reserve(0).unwrap();
    assert!(matches!(target.queue(item), Err(OrbError::LostConnection(_))));
    target.request_shutdown();
  }
}
