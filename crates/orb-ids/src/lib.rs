//! # IDENTIFIERS
//!
//! Defines the identity and addressing types shared by every other crate
//! in the workspace: [Object Id], [Object Locator], and [Sequence Id].
//!
//! These are plain value types. None of them own a socket, a thread, or
//! a lock; they are copied and compared freely by the client and server
//! crates.
//!
//! [Object Id]:      ObjectId
//! [Object Locator]: ObjectLocator
//! [Sequence Id]:    SequenceId

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

/// ## BUCKET COUNT
///
/// The number of buckets in the [Object Registry]'s fixed hash table.
/// Chosen prime per spec, used both by the registry itself and by
/// [ObjectId::bucket_index] so the two never disagree about where an id
/// lives.
///
/// [Object Registry]: ObjectId::bucket_index
pub const BUCKET_COUNT: usize = 109;

/// ## OBJECT ID
///
/// The unique identity of a remote interface instance, independent of
/// location: a 128-bit interface hash paired with a 128-bit instance
/// hash, plus a bucket index precomputed once at construction so that
/// registry lookups never recompute it.
///
/// [ObjectId] is a plain value: immutable, copyable, and cheap to
/// compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
  interface_hash: u128,
  instance_hash: u128,
  bucket: u32,
}

impl ObjectId {
  /// ### NEW OBJECT ID
  ///
  /// Builds an [ObjectId] from pre-hashed interface and instance values,
  /// precomputing the bucket index `hash mod BUCKET_COUNT`.
  pub fn new(interface_hash: u128, instance_hash: u128) -> Self {
    let combined = interface_hash ^ instance_hash.rotate_left(64);
    let bucket = (combined % BUCKET_COUNT as u128) as u32;
    Self { interface_hash, instance_hash, bucket }
  }

  /// ### FROM NAMES
  ///
  /// Convenience constructor for callers who only have textual interface
  /// and instance names on hand. The actual hashing is delegated to a
  /// [Digest128] implementation supplied by the caller; this crate never
  /// ships a hash function of its own, matching the ORB's stance that
  /// cryptographic primitives are consumed through a trait, not
  /// implemented here.
  pub fn from_names(interface: &str, instance: &str, hasher: &dyn Digest128) -> Self {
    Self::new(hasher.digest128(interface.as_bytes()), hasher.digest128(instance.as_bytes()))
  }

  pub fn interface_hash(&self) -> u128 {
    self.interface_hash
  }

  pub fn instance_hash(&self) -> u128 {
    self.instance_hash
  }

  /// ### BUCKET INDEX
  ///
  /// The precomputed `hash mod BUCKET_COUNT` value. The [Object Registry]
  /// must use this and only this for bucket placement, on both insert and
  /// lookup, so the two never disagree.
  ///
  /// [Object Registry]: crate::BUCKET_COUNT
  pub fn bucket_index(&self) -> usize {
    self.bucket as usize
  }
}

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:032x}:{:032x}", self.interface_hash, self.instance_hash)
  }
}

/// ## DIGEST128
///
/// A 128-bit digest function, implemented by a caller-supplied hasher
/// (MD5, truncated SHA, or anything else) and handed to
/// [ObjectId::from_names]. No implementation of this trait is shipped by
/// this crate.
pub trait Digest128 {
  fn digest128(&self, data: &[u8]) -> u128;
}

/// ## OBJECT LOCATOR
///
/// An [ObjectId] plus enough addressing information to contact it: a
/// hostname, a port, a client-class tag used by the server to decide how
/// to handle the connecting client, and an optional resolved IP address
/// cached from a previous connect.
///
/// A locator's `lease_expiry` is a local convenience copy of the lease
/// the binding-name cache computes for the entry it was looked up
/// through; it is populated at lookup time and is not itself
/// authoritative (the cache entry is, see `orb-client`'s
/// `BindingCache`).
#[derive(Debug, Clone)]
pub struct ObjectLocator {
  pub object_id: ObjectId,
  pub host: String,
  pub port: u16,
  pub client_class: String,
  pub resolved_addr: Option<IpAddr>,
  pub lease_expiry: Option<Instant>,
}

impl ObjectLocator {
  pub fn new(object_id: ObjectId, host: impl Into<String>, port: u16, client_class: impl Into<String>) -> Self {
    Self {
      object_id,
      host: host.into(),
      port,
      client_class: client_class.into(),
      resolved_addr: None,
      lease_expiry: None,
    }
  }

  /// The `(host, port)` pair a [ServerTarget] connects to; two locators
  /// that differ only in `object_id` or `client_class` still address the
  /// same endpoint and therefore the same underlying connection.
  ///
  /// [ServerTarget]: crate::ObjectLocator
  pub fn endpoint(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

impl PartialEq for ObjectLocator {
  fn eq(&self, other: &Self) -> bool {
    self.object_id == other.object_id && self.host == other.host && self.port == other.port
  }
}
impl Eq for ObjectLocator {}

/// ## SEQUENCE ID
///
/// A per-target monotone identifier used to correlate a reply with the
/// request that produced it. [SequenceId]s are issued strictly
/// increasing by a single [ServerTarget] and are never reused within a
/// connection's lifetime.
///
/// A 64-bit backing space is reserved so the invariant in spec §3.4
/// ("never wrap within a connection lifetime") holds in practice; only
/// the low 32 bits are placed on the wire, matching the header layout in
/// spec §4.1 (wire headers predate wraparound-safe wide counters and
/// only carry 32 bits of correlation id).
///
/// [ServerTarget]: crate::SequenceId
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

/// The sentinel sequence id reserved for keep-alive frames (spec §4.1).
pub const KEEP_ALIVE_SEQUENCE_ID: u32 = 0x1234_5678;

impl SequenceId {
  pub fn new(value: u64) -> Self {
    Self(value)
  }

  pub fn as_u64(&self) -> u64 {
    self.0
  }

  /// The 32-bit value placed on the wire. A `SequenceId` whose backing
  /// counter has outgrown `u32::MAX` is a programming error for any
  /// connection realistically reaching that volume of in-flight calls;
  /// truncation here is intentional rather than a silent wraparound.
  pub fn wire_value(&self) -> u32 {
    (self.0 & 0xFFFF_FFFF) as u32
  }

  pub fn next(self) -> Self {
    Self(self.0 + 1)
  }
}

impl From<u32> for SequenceId {
  fn from(value: u32) -> Self {
    Self(value as u64)
  }
}

impl fmt::Display for SequenceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct SumHasher;
  impl Digest128 for SumHasher {
    fn digest128(&self, data: &[u8]) -> u128 {
      data.iter().fold(0u128, |acc, b| acc.wrapping_mul(131).wrapping_add(*b as u128))
    }
  }

  #[test]
  fn bucket_index_matches_modulus() {
    let id = ObjectId::new(12345, 67890);
    assert_eq!(id.bucket_index(), ((12345u128 ^ (67890u128).rotate_left(64)) % BUCKET_COUNT as u128) as usize);
    assert!(id.bucket_index() < BUCKET_COUNT);
  }

  #[test]
  fn object_id_from_names_is_deterministic() {
    let hasher = SumHasher;
    let a = ObjectId::from_names("MyInterface", "instance-1", &hasher);
    let b = ObjectId::from_names("MyInterface", "instance-1", &hasher);
    let c = ObjectId::from_names("MyInterface", "instance-2", &hasher);
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn sequence_id_is_monotone_and_truncates_to_wire() {
    let a = SequenceId::new(1);
    let b = a.next();
    assert!(b > a);
    assert_eq!(SequenceId::new(0x1_0000_0001).wire_value(), 1);
  }

  #[test]
  fn locator_endpoint_formats_host_and_port() {
    let id = ObjectId::new(1, 2);
    let locator = ObjectLocator::new(id, "orb.example.internal", 5150, "default");
    assert_eq!(locator.endpoint(), "orb.example.internal:5150");
  }
}
