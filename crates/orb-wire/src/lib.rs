//! # PACKET CODEC
//!
//! Defines the ORB wire [Header] layout, the [Frame] read and write
//! protocols, and the [Encrypter] trait used to optionally encrypt
//! payload bytes in transit.
//!
//! No cryptographic primitives are implemented here; callers that want
//! encryption hand in their own [Encrypter], typically a thin adapter
//! over an AES crate. This crate only knows how to drive the trait at
//! the block level and how to frame the result.
//!
//! ---------------------------------------------------------------------
//!
//! To use the codec:
//! - Call [read_frame] on a connected [TcpStream] to obtain the next
//!   [Frame]: [Frame::KeepAlive], [Frame::Packet], [Frame::NoPacket] (a
//!   clean timeout), or [Frame::Lost] (the connection is no longer
//!   usable).
//! - Call [write_data_frame] or [write_keep_alive] to send.
//!
//! [TcpStream]: std::net::TcpStream

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use thiserror::Error;

/// ## HEADER LENGTH
///
/// Every ORB frame begins with exactly this many bytes of fixed,
/// plaintext header (spec §4.1).
pub const HEADER_LEN: usize = 20;

/// ## MAX PAYLOAD
///
/// The largest payload this codec will write or accept on read. Larger
/// logical payloads are the caller's responsibility to chunk across
/// multiple calls.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

const CHUNK_LEN: usize = 32 * 1024;

const MAGIC1_DATA: u32 = 0xDEAD_BEEF;
const MAGIC1_KEEP_ALIVE: u32 = 0xFEAD_BEAF;
const MAGIC2_DATA: u32 = 0xEADA_BEBA;
const MAGIC2_KEEP_ALIVE: u32 = 0xBEAF_DEAD;

/// The sentinel sequence id carried by keep-alive frames (spec §4.1).
pub const KEEP_ALIVE_SEQUENCE_ID: u32 = 0x1234_5678;

/// ## HEADER
///
/// The fixed 20-byte frame header, little-endian on the wire, with no
/// implicit padding between fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
  magic1: u32,
  payload_hash: u32,
  payload_len: u32,
  sequence_id: u32,
  magic2: u32,
}

impl Header {
  fn to_bytes(self) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&self.magic1.to_le_bytes());
    buf[4..8].copy_from_slice(&self.payload_hash.to_le_bytes());
    buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
    buf[12..16].copy_from_slice(&self.sequence_id.to_le_bytes());
    buf[16..20].copy_from_slice(&self.magic2.to_le_bytes());
    buf
  }

  fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
    Self {
      magic1: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
      payload_hash: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
      payload_len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
      sequence_id: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
      magic2: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
    }
  }
}

/// ## FRAME
///
/// The result of one [read_frame] call.
#[derive(Debug)]
pub enum Frame {
  /// A data frame carrying a plaintext (post-decryption) payload.
  Packet { sequence_id: u32, payload: Vec<u8> },
  /// A header-only liveness frame; never placed on the work queue.
  KeepAlive,
  /// The read timed out with no bytes received at all, an allowable,
  /// non-fatal quiescent period.
  NoPacket,
  /// The connection is no longer usable: peer close, a partial read
  /// that can't be completed, a magic mismatch, a hash mismatch, or a
  /// zero-length data frame.
  Lost,
}

/// ## WIRE ERROR
///
/// Failures surfaced by the write path. The read path reports failure
/// through [Frame::Lost] instead, since a caller reading frames in a
/// loop wants a value, not a `Result`, for the common "nothing to read
/// yet" and "connection died" cases.
#[derive(Debug, Error)]
pub enum WireError {
  #[error("payload of {0} bytes exceeds the {1}-byte maximum")]
  PayloadTooLarge(usize, usize),
  #[error("write failed: {0}")]
  Io(#[from] std::io::Error),
}

/// ## ENCRYPTER
///
/// A symmetric block cipher adapter. The codec drives this trait one
/// block at a time; it never constructs key schedules or manages IVs;
/// that is entirely the implementation's concern.
pub trait Encrypter: Send + Sync {
  /// The cipher's block size in bytes. Payloads are zero-padded up to a
  /// multiple of this size before [Encrypter::encrypt_block] is called.
  fn block_size(&self) -> usize;

  /// Encrypts exactly one block in place.
  fn encrypt_block(&self, block: &mut [u8]);

  /// Decrypts exactly one block in place.
  fn decrypt_block(&self, block: &mut [u8]);
}

/// Rolling sum-modulo-109 integrity check over plaintext payload bytes,
/// zero-extended to 32 bits. This is a cheap corruption check, not a
/// cryptographic MAC.
pub fn payload_hash(payload: &[u8]) -> u32 {
  payload.iter().fold(0u32, |acc, &b| (acc + b as u32) % 109)
}

fn padded_len(logical_len: usize, encrypter: Option<&dyn Encrypter>) -> usize {
  match encrypter {
    Some(enc) => {
      let block = enc.block_size().max(1);
      let blocks = (logical_len + block - 1) / block;
      blocks.max(1) * block
    }
    None => logical_len,
  }
}

fn encrypt_in_place(buf: &mut [u8], encrypter: &dyn Encrypter) {
  let block = encrypter.block_size().max(1);
  for chunk in buf.chunks_mut(block) {
    encrypter.encrypt_block(chunk);
  }
}

fn decrypt_in_place(buf: &mut [u8], encrypter: &dyn Encrypter) {
  let block = encrypter.block_size().max(1);
  for chunk in buf.chunks_mut(block) {
    encrypter.decrypt_block(chunk);
  }
}

fn is_timeout(err: &std::io::Error) -> bool {
  matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// ## READ FRAME
/// **Based on spec §4.1**
///
/// Reads one [Frame] from `stream`, blocking with timeout.
///
/// This function temporarily overrides the stream's read timeout while
/// it runs (1 second per header/chunk attempt) and restores whatever
/// timeout was previously configured before returning, so callers using
/// a longer-lived per-connection timeout (T8-style) are not disturbed.
pub fn read_frame(mut stream: &TcpStream, timeout_adjust: Duration, encrypter: Option<&dyn Encrypter>) -> Frame {
  let prior_timeout = stream.read_timeout().ok().flatten();
  let restore = |stream: &TcpStream| {
    let _ = stream.set_read_timeout(prior_timeout);
  };

  if stream.set_read_timeout(Some(Duration::from_secs(1))).is_err() {
    return Frame::Lost;
  }

  // READ HEADER
  //
  // Exactly 20 bytes are expected. A zero-byte read at any point means
  // the peer has closed the connection; a timeout with nothing received
  // yet is an allowable quiescent period; a timeout after a partial read
  // is unacceptable.
  let mut header_buf = [0u8; HEADER_LEN];
  let mut filled = 0usize;
  loop {
    match stream.read(&mut header_buf[filled..]) {
      Ok(0) => {
        restore(stream);
        return Frame::Lost;
      }
      Ok(n) => {
        filled += n;
        if filled == HEADER_LEN {
          break;
        }
      }
      Err(e) if is_timeout(&e) => {
        restore(stream);
        return if filled == 0 { Frame::NoPacket } else { Frame::Lost };
      }
      Err(_) => {
        restore(stream);
        return Frame::Lost;
      }
    }
  }

  let header = Header::from_bytes(&header_buf);

  // INSPECT MAGIC PAIR
  if header.magic1 == MAGIC1_KEEP_ALIVE && header.magic2 == MAGIC2_KEEP_ALIVE {
    restore(stream);
    return Frame::KeepAlive;
  }
  if !(header.magic1 == MAGIC1_DATA && header.magic2 == MAGIC2_DATA) {
    restore(stream);
    return Frame::Lost;
  }
  if header.payload_len == 0 {
    restore(stream);
    return Frame::Lost;
  }
  let logical_len = header.payload_len as usize;
  if logical_len > MAX_PAYLOAD {
    tracing::warn!(logical_len, "rejecting frame with oversized payload length");
    restore(stream);
    return Frame::Lost;
  }

  // READ PAYLOAD
  let physical_len = padded_len(logical_len, encrypter);
  let budget = Duration::from_secs(6) + timeout_adjust;
  let max_empty_reads: u32 = if timeout_adjust.is_zero() { 3 } else { 5 };
  let start = Instant::now();
  let mut buf = vec![0u8; physical_len];
  let mut filled = 0usize;
  let mut empty_reads = 0u32;
  while filled < physical_len {
    if start.elapsed() > budget {
      tracing::debug!("payload read exceeded total budget");
      restore(stream);
      return Frame::Lost;
    }
    let end = (filled + CHUNK_LEN).min(physical_len);
    match stream.read(&mut buf[filled..end]) {
      Ok(0) => {
        restore(stream);
        return Frame::Lost;
      }
      Ok(n) => {
        filled += n;
        empty_reads = 0;
      }
      Err(e) if is_timeout(&e) => {
        empty_reads += 1;
        if empty_reads >= max_empty_reads {
          restore(stream);
          return Frame::Lost;
        }
      }
      Err(_) => {
        restore(stream);
        return Frame::Lost;
      }
    }
  }
  restore(stream);

  if let Some(enc) = encrypter {
    decrypt_in_place(&mut buf, enc);
  }
  buf.truncate(logical_len);

  let computed = payload_hash(&buf);
  if computed != header.payload_hash {
    tracing::warn!(computed, expected = header.payload_hash, "payload hash mismatch");
    return Frame::Lost;
  }

  Frame::Packet { sequence_id: header.sequence_id, payload: buf }
}

/// ## WRITE DATA FRAME
/// **Based on spec §4.1**
///
/// Sends one data frame: a plaintext header followed by a payload that
/// is encrypted per block (with zero padding absorbed by the cipher) if
/// `encrypter` is set. Header and payload are written in a single
/// throttled sequence of writes bounded by a 5-second base timeout plus
/// `timeout_adjust`.
pub fn write_data_frame(
  stream: &TcpStream,
  sequence_id: u32,
  payload: &[u8],
  timeout_adjust: Duration,
  encrypter: Option<&dyn Encrypter>,
) -> Result<(), WireError> {
  if payload.len() > MAX_PAYLOAD {
    return Err(WireError::PayloadTooLarge(payload.len(), MAX_PAYLOAD));
  }

  let hash = payload_hash(payload);
  let mut wire_payload = payload.to_vec();
  if let Some(enc) = encrypter {
    wire_payload.resize(padded_len(payload.len(), Some(enc)), 0);
    encrypt_in_place(&mut wire_payload, enc);
  }

  let header = Header {
    magic1: MAGIC1_DATA,
    payload_hash: hash,
    payload_len: payload.len() as u32,
    sequence_id,
    magic2: MAGIC2_DATA,
  };

  throttled_write(stream, &header.to_bytes(), timeout_adjust)?;
  throttled_write(stream, &wire_payload, timeout_adjust)?;
  Ok(())
}

/// ## WRITE KEEP ALIVE
///
/// Sends a header-only liveness frame that the remote side consumes
/// silently to reset its idle timer.
pub fn write_keep_alive(stream: &TcpStream, timeout_adjust: Duration) -> Result<(), WireError> {
  let header = Header {
    magic1: MAGIC1_KEEP_ALIVE,
    payload_hash: 0,
    payload_len: 0,
    sequence_id: KEEP_ALIVE_SEQUENCE_ID,
    magic2: MAGIC2_KEEP_ALIVE,
  };
  throttled_write(stream, &header.to_bytes(), timeout_adjust)
}

fn throttled_write(stream: &TcpStream, mut buf: &[u8], timeout_adjust: Duration) -> Result<(), WireError> {
  let prior_timeout = stream.write_timeout().ok().flatten();
  stream.set_write_timeout(Some(Duration::from_secs(5) + timeout_adjust))?;
  let mut stream = stream;
  let result = (|| -> Result<(), WireError> {
    while !buf.is_empty() {
      let n = stream.write(buf)?;
      if n == 0 {
        return Err(WireError::Io(std::io::Error::from(ErrorKind::WriteZero)));
      }
      buf = &buf[n..];
    }
    Ok(())
  })();
  let _ = stream.set_write_timeout(prior_timeout);
  result
}

/// ## HANDSHAKE
/// **Based on spec §4.3 and §6**
///
/// The 4-byte status code exchanged immediately after `accept`/`connect`,
/// ahead of any framed traffic.
pub mod handshake {
  use std::io::{ErrorKind, Read, Write};
  use std::net::TcpStream;
  use std::time::Duration;

  pub const ACCEPTED: u32 = 0x19A4_58F1;
  pub const TOO_MANY_CLIENTS: u32 = 0xE922_0A4C;
  pub const NOT_BLESSED: u32 = 0x9FF9_8FA3;

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub enum HandshakeCode {
    Accepted,
    TooManyClients,
    NotBlessed,
    Unknown(u32),
  }

  impl From<u32> for HandshakeCode {
    fn from(value: u32) -> Self {
      match value {
        ACCEPTED => HandshakeCode::Accepted,
        TOO_MANY_CLIENTS => HandshakeCode::TooManyClients,
        NOT_BLESSED => HandshakeCode::NotBlessed,
        other => HandshakeCode::Unknown(other),
      }
    }
  }

  /// Sends the 4-byte handshake status code the server sends immediately
  /// on accept.
  pub fn send(stream: &TcpStream, code: u32) -> std::io::Result<()> {
    let mut stream = stream;
    stream.write_all(&code.to_le_bytes())
  }

  /// Reads the 4-byte handshake status code within `timeout`. Any error,
  /// including a timeout, is reported as `Err(())`; the caller treats
  /// handshake failure uniformly regardless of cause.
  pub fn read(mut stream: &TcpStream, timeout: Duration) -> Result<HandshakeCode, ()> {
    let prior = stream.read_timeout().ok().flatten();
    let _ = stream.set_read_timeout(Some(timeout));
    let mut buf = [0u8; 4];
    let mut filled = 0;
    let result = loop {
      match stream.read(&mut buf[filled..]) {
        Ok(0) => break Err(()),
        Ok(n) => {
          filled += n;
          if filled == 4 {
            break Ok(HandshakeCode::from(u32::from_le_bytes(buf)));
          }
        }
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => break Err(()),
        Err(_) => break Err(()),
      }
    };
    let _ = stream.set_read_timeout(prior);
    result
  }
}
