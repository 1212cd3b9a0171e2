//! # ERROR TAXONOMY
//!
//! A single [OrbError] enum shared by every layer of the workspace, so a
//! caller can match on a stable set of kinds regardless of whether the
//! failure originated in the codec, the client spooler, or the server
//! dispatch path.
//!
//! Per spec §7: failures inside a remote call are serialized into the
//! reply buffer with a status bit set to failure, and the client
//! rethrows them in the caller's context; spooler tasks never propagate
//! failures into caller threads directly, they convert transport
//! failures into [OrbError::LostConnection] values attached to the
//! affected [CmdItem]s.
//!
//! [CmdItem]: https://docs.rs/orb-cmditem

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrbError {
  /// Peer close, timeout during active I/O, or handshake failure.
  #[error("lost connection to {0}")]
  LostConnection(String),

  /// The caller-side deadline elapsed before a reply arrived.
  #[error("call timed out after {0:?}")]
  Timeout(std::time::Duration),

  /// The server has no object registered under the requested id. The
  /// client MUST remove the corresponding binding from its cache on
  /// receipt of this error (spec §7).
  #[error("object not found")]
  NotFound,

  /// Registering an object whose id collides with an existing one.
  #[error("object id already registered")]
  Duplicate,

  /// Handshake-time rejection: too many clients already connected.
  #[error("rejected: too many clients")]
  RejectedTooMany,

  /// Handshake-time rejection: source address not permitted.
  #[error("rejected: source address not permitted")]
  RejectedNotBlessed,

  /// Magic mismatch, hash mismatch, partial read, or zero-length data
  /// frame.
  #[error("malformed frame: {0}")]
  BadFrame(String),

  /// The command-item pool is exhausted; the exclusive backpressure
  /// mechanism for the client.
  #[error("command item pool exhausted")]
  OutOfResource,

  /// An invariant was violated: refcount underflow, a bad bucket index,
  /// or similar. Programming errors, not runtime conditions, treated as
  /// process-fatal by callers that detect them.
  #[error("internal invariant violated: {0}")]
  Internal(String),

  /// An API was called before the relevant `init` completed.
  #[error("not ready: {0} was called before init")]
  NotReady(String),
}

impl OrbError {
  /// ## IS CONNECTION FATAL
  ///
  /// The "was this error fatal to the connection" classifier from spec
  /// §7: true for [OrbError::LostConnection] and for [OrbError::NotFound]
  /// (the object is gone even if the socket is live, so any proxy bound
  /// to it should treat the binding as dead).
  pub fn is_connection_fatal(&self) -> bool {
    matches!(self, OrbError::LostConnection(_) | OrbError::NotFound)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn lost_connection_and_not_found_are_connection_fatal() {
    assert!(OrbError::LostConnection("host:1".into()).is_connection_fatal());
    assert!(OrbError::NotFound.is_connection_fatal());
  }

  #[test]
  fn timeout_and_duplicate_are_not_connection_fatal() {
    assert!(!OrbError::Timeout(Duration::from_millis(50)).is_connection_fatal());
    assert!(!OrbError::Duplicate.is_connection_fatal());
  }
}
