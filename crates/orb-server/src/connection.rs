//! # PER-CONNECTION TASK
//! **Based on spec §4.7**
//!
//! One [Connection] per accepted socket: a reader loop that turns wire
//! frames into [WorkItem]s for the shared [WorkerPool], and a write side
//! shared by whichever worker thread finishes dispatching a given call.
//! Unlike the client's spooler, replies here are not serialized through
//! a single thread, since several worker threads may finish calls for the
//! same connection concurrently, so writes go through a [Mutex].

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use orb_error::OrbError;
use orb_ids::ObjectId;
use orb_wire::{Encrypter, Frame};

use crate::workpool::{WorkItem, WorkerPool};

/// The fixed-size addressing prefix every call payload carries ahead of
/// its marshalled body: the callee's interface hash and instance hash,
/// little-endian. Routing by [ObjectId] is in scope (spec §4.9); the
/// marshalling format of the body itself is not (spec's IDL Non-goal).
const ENVELOPE_LEN: usize = 32;

/// How long a connection may go without a data or keep-alive frame from
/// the client before the server closes it (spec §4.7, §6).
const MAX_IDLE: Duration = Duration::from_secs(60);

/// ## CONNECTION
/// See the module documentation.
pub struct Connection {
  peer: std::net::SocketAddr,
  write_half: Mutex<TcpStream>,
  encrypter: Option<Arc<dyn Encrypter>>,
  timeout_adjust: Duration,
  alive: AtomicBool,
}

impl Connection {
  pub fn new(stream: TcpStream, encrypter: Option<Arc<dyn Encrypter>>, timeout_adjust: Duration) -> Self {
    let peer = stream.peer_addr().unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
    Self { peer, write_half: Mutex::new(stream), encrypter, timeout_adjust, alive: AtomicBool::new(true) }
  }

  pub fn peer(&self) -> std::net::SocketAddr {
    self.peer
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  /// ### REPLY
  ///
  /// Writes a successful reply's body back as a data frame.
  pub fn reply(&self, sequence_id: u32, body: &[u8]) {
    let stream = self.write_half.lock().unwrap();
    if orb_wire::write_data_frame(&stream, sequence_id, body, self.timeout_adjust, self.encrypter.as_deref()).is_err() {
      self.alive.store(false, Ordering::SeqCst);
    }
  }

  /// ### REPLY ERROR
  /// **Based on spec §7's "failures ... are serialized into the reply
  /// buffer with a status bit set to failure"**
  ///
  /// A one-byte failure tag followed by the error's display text, so the
  /// caller can reconstruct enough of an [OrbError] to rethrow it in its
  /// own context. [OrbError::NotFound] gets its own tag since the client
  /// must specifically know to drop its binding-cache entry on receipt.
  pub fn reply_error(&self, sequence_id: u32, error: &OrbError) {
    let mut body = Vec::with_capacity(64);
    body.push(error_tag(error));
    body.extend_from_slice(error.to_string().as_bytes());
    self.reply(sequence_id, &body);
  }
}

fn error_tag(error: &OrbError) -> u8 {
  match error {
    OrbError::NotFound => 1,
    OrbError::Duplicate => 2,
    OrbError::Timeout(_) => 3,
    _ => 0,
  }
}

/// ### RUN CONNECTION
///
/// Drives one accepted connection until it closes: reads frames in a
/// loop, tracks last-activity on every data or keep-alive frame, parses
/// the envelope off each data frame and submits the rest to `pool`.
/// Keep-alive is client-to-server only (spec §6); the server never
/// replies to one, and never sends one of its own. Once the connection
/// has gone `MAX_IDLE` without activity, the server closes it itself.
pub fn run_connection(stream: TcpStream, pool: Arc<WorkerPool>, encrypter: Option<Arc<dyn Encrypter>>, timeout_adjust: Duration) {
  let read_stream = match stream.try_clone() {
    Ok(s) => s,
    Err(_) => return,
  };
  let connection = Arc::new(Connection::new(stream, encrypter.clone(), timeout_adjust));
  tracing::info!(peer = %connection.peer(), "connection accepted");

  let mut last_activity = Instant::now();

  loop {
    if !connection.is_alive() {
      break;
    }
    if last_activity.elapsed() > MAX_IDLE {
      tracing::info!(peer = %connection.peer(), "closing idle connection");
      break;
    }
    match orb_wire::read_frame(&read_stream, timeout_adjust, encrypter.as_deref()) {
      Frame::Packet { sequence_id, payload } => {
        last_activity = Instant::now();
        if payload.len() < ENVELOPE_LEN {
          tracing::warn!(sequence_id, "payload shorter than the addressing envelope; dropping connection");
          break;
        }
        let interface_hash = u128::from_le_bytes(payload[0..16].try_into().unwrap());
        let instance_hash = u128::from_le_bytes(payload[16..32].try_into().unwrap());
        let object_id = ObjectId::new(interface_hash, instance_hash);
        let body = payload[ENVELOPE_LEN..].to_vec();
        pool.submit(WorkItem { connection: connection.clone(), sequence_id, object_id, body });
      }
      Frame::KeepAlive => {
        last_activity = Instant::now();
      }
      Frame::NoPacket => {}
      Frame::Lost => break,
    }
  }

  tracing::info!(peer = %connection.peer(), "connection closed");
}
