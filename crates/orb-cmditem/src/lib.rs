//! # COMMAND ITEM AND POOL
//!
//! A [CmdItem] is the reusable envelope that carries one request's
//! marshalled bytes out to a [ServerTarget] and one reply's marshalled
//! bytes back to the waiting caller. [CmdItemPool] bounds how many are
//! reserved at once, which is the client's sole backpressure mechanism.
//!
//! ---------------------------------------------------------------------
//!
//! To use a [CmdItem]:
//! - [CmdItemPool::reserve] one, marshal request bytes into it with
//!   [CmdItem::with_output], and hand it to a `ServerTarget::queue`.
//! - Wait on the [oneshot::Receiver] returned alongside it for the
//!   [CmdOutcome].
//! - Call [CmdItemPool::release] when done with it, whatever the outcome.
//!
//! [ServerTarget]: https://docs.rs/orb-client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use oneshot::Sender as OnceSender;
use orb_error::OrbError;
use orb_ids::SequenceId;

/// ## DEFAULT POOL CAPACITY
///
/// The default bound on simultaneously reserved [CmdItem]s (spec §4.2).
pub const DEFAULT_POOL_CAP: usize = 128;

const GROW_CAP: usize = 8 * 1024 * 1024;
const SHRINK_THRESHOLD: usize = 16 * 1024;
const SHRINK_TARGET: usize = 1024;

/// ## CMD STATE
/// **Based on spec §3 (Data Model) and §4.2**
///
/// The lifecycle of a [CmdItem]. Transitions are guarded by the item's
/// own mutex; a [CmdItem] is in exactly one of these states at every
/// instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
  /// In the pool's free list, available for reservation.
  Free,
  /// Reserved by a caller, not yet queued to a target.
  Wait,
  /// Queued on a `ServerTarget`'s outbound FIFO, not yet sent.
  CmdQ,
  /// Sent; waiting in a `ServerTarget`'s reply list for correlation.
  ReplyList,
  /// A reply (or abort) has been delivered; the caller has not yet
  /// released the item.
  Ready,
  /// The caller gave up on this item (dropped it or it timed out) while
  /// it was still in `CmdQ` or `ReplyList`. Terminal until the spooler
  /// next encounters it, at which point it becomes `Free`.
  Orphaned,
}

/// ## CMD OUTCOME
///
/// What a waiting caller eventually receives: the reply payload, or the
/// transport error that prevented one from arriving.
pub type CmdOutcome = Result<Vec<u8>, OrbError>;

struct Inner {
  state: CmdState,
  buffer: Vec<u8>,
  sequence_id: Option<SequenceId>,
  start_time: Option<Instant>,
  waiter: Option<OnceSender<CmdOutcome>>,
}

/// ## CMD ITEM
///
/// See the module documentation for the full lifecycle.
pub struct CmdItem {
  inner: Mutex<Inner>,
}

impl CmdItem {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: Mutex::new(Inner {
        state: CmdState::Free,
        buffer: Vec::with_capacity(SHRINK_TARGET),
        sequence_id: None,
        start_time: None,
        waiter: None,
      }),
    })
  }

  /// The item's current lifecycle state.
  pub fn state(&self) -> CmdState {
    self.inner.lock().unwrap().state
  }

  pub fn sequence_id(&self) -> Option<SequenceId> {
    self.inner.lock().unwrap().sequence_id
  }

  pub fn start_time(&self) -> Option<Instant> {
    self.inner.lock().unwrap().start_time
  }

  /// ### OUTPUT-MODE VIEW
  ///
  /// Hands the marshalling buffer to `f` for a caller (typically a
  /// generated proxy stub) to write request bytes into before queueing.
  pub fn with_output<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    let mut inner = self.inner.lock().unwrap();
    f(&mut inner.buffer)
  }

  /// ### INPUT-MODE VIEW
  ///
  /// Hands the marshalling buffer to `f` for a caller (typically a
  /// generated proxy stub) to read reply bytes out of once the item is
  /// `Ready`.
  pub fn with_input<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
    let inner = self.inner.lock().unwrap();
    f(&inner.buffer)
  }

  /// Resets the item to `Wait`, sized to at least `capacity_hint`,
  /// installing a fresh one-shot waiter. Used only by [CmdItemPool].
  fn reset_for_reserve(self: &Arc<Self>, capacity_hint: usize) -> oneshot::Receiver<CmdOutcome> {
    let mut inner = self.inner.lock().unwrap();
    if inner.buffer.capacity() > SHRINK_THRESHOLD {
      inner.buffer = Vec::with_capacity(SHRINK_TARGET);
    } else {
      inner.buffer.clear();
    }
    if capacity_hint > inner.buffer.capacity() {
      let additional = capacity_hint.min(GROW_CAP) - inner.buffer.capacity();
      inner.buffer.reserve(additional);
    }
    inner.state = CmdState::Wait;
    inner.sequence_id = None;
    inner.start_time = None;
    let (tx, rx) = oneshot::channel();
    inner.waiter = Some(tx);
    rx
  }

  /// ### QUEUE TRANSITION
  ///
  /// `Wait -> CmdQ`. Called by `ServerTarget::queue` under its own
  /// `outbound_mutex`, after which it assigns the sequence id.
  pub fn mark_cmdq(&self, sequence_id: SequenceId) {
    let mut inner = self.inner.lock().unwrap();
    inner.state = CmdState::CmdQ;
    inner.sequence_id = Some(sequence_id);
    inner.start_time = Some(Instant::now());
  }

  /// ### SEND TRANSITION
  ///
  /// `CmdQ -> ReplyList`. Called by the spooler once the frame has been
  /// written to the socket.
  pub fn mark_reply_list(&self) {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == CmdState::CmdQ {
      inner.state = CmdState::ReplyList;
    }
  }

  /// ### DELIVER REPLY
  ///
  /// Called by the spooler when a reply frame matching this item's
  /// sequence id arrives. If the item has been orphaned in the meantime,
  /// the payload is discarded and the item silently becomes `Free`
  /// without waking anyone (spec §8: "A reply for an orphaned CmdItem is
  /// discarded without waking any thread"). Returns `true` if a waiter
  /// was actually woken.
  pub fn deliver_reply(&self, payload: Vec<u8>) -> bool {
    self.complete(Ok(payload))
  }

  /// ### ABORT
  ///
  /// Called by the spooler when the connection is lost while this item
  /// is in `CmdQ` or `ReplyList`. Same orphan-discard behavior as
  /// [CmdItem::deliver_reply].
  pub fn abort(&self, error: OrbError) -> bool {
    self.complete(Err(error))
  }

  fn complete(&self, outcome: CmdOutcome) -> bool {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      CmdState::Orphaned => {
        inner.state = CmdState::Free;
        inner.waiter = None;
        false
      }
      _ => {
        inner.state = CmdState::Ready;
        if let Ok(ref payload) = outcome {
          inner.buffer.clear();
          inner.buffer.extend_from_slice(payload);
        }
        if let Some(waiter) = inner.waiter.take() {
          let _ = waiter.send(outcome);
          true
        } else {
          false
        }
      }
    }
  }

  /// Marks the item `Orphaned` if it is currently `CmdQ` or
  /// `ReplyList`; otherwise, per spec §4.2's release table, marks it
  /// `Free` immediately (or leaves `Free` items alone). Returns `true`
  /// if the item is now `Free` and should be reclaimed by the pool.
  fn release_transition(&self) -> bool {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      CmdState::CmdQ | CmdState::ReplyList => {
        inner.state = CmdState::Orphaned;
        false
      }
      CmdState::Wait | CmdState::Ready | CmdState::Orphaned => {
        inner.state = CmdState::Free;
        inner.waiter = None;
        true
      }
      CmdState::Free => false,
    }
  }

  /// Used by the spooler while draining the outbound queue or sweeping
  /// the reply list: if this item is `Orphaned`, transitions it to
  /// `Free` and reports that it should be dropped from the collection
  /// and reclaimed by the pool.
  pub fn reclaim_if_orphaned(&self) -> bool {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == CmdState::Orphaned {
      inner.state = CmdState::Free;
      inner.waiter = None;
      true
    } else {
      false
    }
  }
}

/// ## CMD ITEM POOL
/// **Based on spec §4.2**
///
/// Bounds the number of simultaneously reserved [CmdItem]s. Exceeding
/// the bound is the client's exclusive backpressure mechanism;
/// [CmdItemPool::reserve] fails with [OrbError::OutOfResource] rather
/// than growing without limit.
pub struct CmdItemPool {
  free_list: Mutex<Vec<Arc<CmdItem>>>,
  reserved: AtomicUsize,
  cap: usize,
}

impl CmdItemPool {
  pub fn new() -> Self {
    Self::with_cap(DEFAULT_POOL_CAP)
  }

  pub fn with_cap(cap: usize) -> Self {
    Self { free_list: Mutex::new(Vec::new()), reserved: AtomicUsize::new(0), cap }
  }

  pub fn capacity(&self) -> usize {
    self.cap
  }

  /// Number of items currently reserved (not `Free`). Used by tests to
  /// assert no leaks remain at the end of a run.
  pub fn reserved_count(&self) -> usize {
    self.reserved.load(Ordering::SeqCst)
  }

  /// ### RESERVE
  ///
  /// Returns a `Free` item (allocating a new one if the free list is
  /// empty and the pool is not at capacity) in state `Wait`, sized to at
  /// least `capacity_hint`, along with the [oneshot::Receiver] the
  /// caller should wait on for the [CmdOutcome].
  pub fn reserve(self: &Arc<Self>, capacity_hint: usize) -> Result<(Arc<CmdItem>, oneshot::Receiver<CmdOutcome>), OrbError> {
    let mut free_list = self.free_list.lock().unwrap();
    if let Some(item) = free_list.pop() {
      drop(free_list);
      self.reserved.fetch_add(1, Ordering::SeqCst);
      let rx = item.reset_for_reserve(capacity_hint);
      return Ok((item, rx));
    }
    drop(free_list);
    if self.reserved.load(Ordering::SeqCst) >= self.cap {
      return Err(OrbError::OutOfResource);
    }
    let item = CmdItem::new();
    self.reserved.fetch_add(1, Ordering::SeqCst);
    let rx = item.reset_for_reserve(capacity_hint);
    Ok((item, rx))
  }

  /// ### RELEASE
  /// **Based on spec §4.2's release transition table**
  pub fn release(&self, item: &Arc<CmdItem>) {
    if item.release_transition() {
      self.reclaim(item);
    }
  }

  /// Pushes an item the caller has already confirmed is `Free` back onto
  /// the free list, decrementing the reserved count. Used both by
  /// [CmdItemPool::release] and by `ServerTarget` after it discovers an
  /// orphaned item via [CmdItem::reclaim_if_orphaned].
  pub fn reclaim(&self, item: &Arc<CmdItem>) {
    self.reserved.fetch_sub(1, Ordering::SeqCst);
    self.free_list.lock().unwrap().push(item.clone());
  }
}

impl Default for CmdItemPool {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn reserve_then_release_returns_item_to_free_state() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, _rx) = pool.reserve(64).unwrap();
    assert_eq!(item.state(), CmdState::Wait);
    pool.release(&item);
    assert_eq!(item.state(), CmdState::Free);
    assert_eq!(pool.reserved_count(), 0);
  }

  #[test]
  fn pool_cap_is_exclusive_backpressure() {
    let pool = Arc::new(CmdItemPool::with_cap(2));
    let (a, _ra) = pool.reserve(0).unwrap();
    let (_b, _rb) = pool.reserve(0).unwrap();
    assert!(matches!(pool.reserve(0), Err(OrbError::OutOfResource)));
    pool.release(&a);
    assert!(pool.reserve(0).is_ok());
  }

  #[test]
  fn deliver_reply_wakes_waiter_with_payload() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, rx) = pool.reserve(0).unwrap();
    item.mark_cmdq(SequenceId::new(1));
    item.mark_reply_list();
    assert!(item.deliver_reply(vec![9, 9]));
    assert_eq!(rx.recv().unwrap().unwrap(), vec![9, 9]);
    assert_eq!(item.state(), CmdState::Ready);
  }

  #[test]
  fn orphaned_reply_is_discarded_without_waking_anyone() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, rx) = pool.reserve(0).unwrap();
    item.mark_cmdq(SequenceId::new(1));
    item.mark_reply_list();
    pool.release(&item); // caller gave up: ReplyList -> Orphaned
    assert_eq!(item.state(), CmdState::Orphaned);
    assert!(!item.deliver_reply(vec![1]));
    assert_eq!(item.state(), CmdState::Free);
    assert!(rx.recv().is_err(), "no outcome should ever be sent for an orphaned item");
  }

  #[test]
  fn release_while_wait_frees_immediately() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, _rx) = pool.reserve(0).unwrap();
    pool.release(&item);
    assert_eq!(item.state(), CmdState::Free);
    assert_eq!(pool.reserved_count(), 0);
  }

  #[test]
  fn abort_delivers_timeout_error_to_waiter() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, rx) = pool.reserve(0).unwrap();
    item.mark_cmdq(SequenceId::new(5));
    assert!(item.abort(OrbError::Timeout(Duration::from_millis(50))));
    assert!(matches!(rx.recv().unwrap(), Err(OrbError::Timeout(_))));
  }

  #[test]
  fn buffer_shrinks_back_on_reset_after_growing_past_threshold() {
    let pool = Arc::new(CmdItemPool::new());
    let (item, _rx) = pool.reserve(0).unwrap();
    item.with_output(|buf| buf.resize(64 * 1024, 0));
    pool.release(&item);
    let (item2, _rx2) = pool.reserve(0).unwrap();
    assert!(Arc::ptr_eq(&item, &item2), "pool should reuse the freed item");
    item2.with_output(|buf| assert!(buf.capacity() <= SHRINK_TARGET * 2));
  }
}
