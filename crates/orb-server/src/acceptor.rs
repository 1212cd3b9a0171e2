//! # WIRE ACCEPTOR
//! **Based on spec §4.6**
//!
//! Binds a listening socket, accepts connections in a loop, and applies
//! the two admission checks before a connection is allowed to exchange
//! any framed traffic: the live-connection count against a cap, then
//! (if configured) a source-address allowlist. A rejected connection
//! receives its handshake status code and is closed immediately,
//! without ever being handed to a [Connection] task.
//!
//! [Connection]: crate::connection::Connection

use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use orb_wire::{handshake, Encrypter};

use crate::connection::run_connection;
use crate::workpool::WorkerPool;

/// The default live-connection cap (spec §4.6), clamped to 256 even if
/// a caller requests more.
pub const MAX_CONNECTION_CAP: usize = 256;

/// ## ACCEPTOR CONFIG
pub struct AcceptorConfig {
  pub connection_cap: usize,
  pub allowed_addresses: Option<Vec<IpAddr>>,
  pub encrypter: Option<Arc<dyn Encrypter>>,
  pub timeout_adjust: Duration,
}

impl Default for AcceptorConfig {
  fn default() -> Self {
    Self { connection_cap: MAX_CONNECTION_CAP, allowed_addresses: None, encrypter: None, timeout_adjust: Duration::ZERO }
  }
}

/// ## WIRE ACCEPTOR
/// See the module documentation.
pub struct WireAcceptor {
  listener: TcpListener,
  config: AcceptorConfig,
  live_connections: Arc<AtomicUsize>,
}

impl WireAcceptor {
  pub fn bind(addr: impl std::net::ToSocketAddrs, config: AcceptorConfig) -> std::io::Result<Self> {
    let connection_cap = config.connection_cap.min(MAX_CONNECTION_CAP);
    let listener = TcpListener::bind(addr)?;
    Ok(Self { listener, config: AcceptorConfig { connection_cap, ..config }, live_connections: Arc::new(AtomicUsize::new(0)) })
  }

  pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
    self.listener.local_addr()
  }

  /// ### SERVE
  ///
  /// Accepts connections until the listener errors (e.g. it is shut
  /// down by dropping the last clone of its underlying socket), spawning
  /// one [run_connection] task per admitted connection.
  pub fn serve(self, pool: Arc<WorkerPool>) {
    for incoming in self.listener.incoming() {
      let stream = match incoming {
        Ok(stream) => stream,
        Err(_) => continue,
      };
      self.admit(stream, &pool);
    }
  }

  fn admit(&self, stream: TcpStream, pool: &Arc<WorkerPool>) {
    // COUNT CHECK FIRST, THEN ADDRESS FILTER (spec §4.6's stated order).
    if self.live_connections.load(Ordering::SeqCst) >= self.config.connection_cap {
      let _ = handshake::send(&stream, handshake::TOO_MANY_CLIENTS);
      return;
    }
    if let Some(allowed) = &self.config.allowed_addresses {
      let peer_ip = stream.peer_addr().map(|a| a.ip()).ok();
      if peer_ip.map(|ip| !allowed.contains(&ip)).unwrap_or(true) {
        let _ = handshake::send(&stream, handshake::NOT_BLESSED);
        return;
      }
    }
    let _ = stream.set_nodelay(true);
    if handshake::send(&stream, handshake::ACCEPTED).is_err() {
      return;
    }

    self.live_connections.fetch_add(1, Ordering::SeqCst);
    let live_connections = self.live_connections.clone();
    let pool = pool.clone();
    let encrypter = self.config.encrypter.clone();
    let timeout_adjust = self.config.timeout_adjust;
    thread::spawn(move || {
      run_connection(stream, pool, encrypter, timeout_adjust);
      live_connections.fetch_sub(1, Ordering::SeqCst);
    });
  }
}
