//! # OBJECT REGISTRY
//! **Based on spec §4.9**
//!
//! A fixed 109-bucket hash table mapping [ObjectId] to the handler
//! registered for it. Deregistration is drain-safe: an object being
//! deregistered is removed from lookup immediately, but the call
//! returns only once every in-flight dispatch against it has finished
//! (or after a 10-second timeout, whichever comes first).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use orb_error::OrbError;
use orb_ids::{ObjectId, BUCKET_COUNT};

const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// ## OBJECT HANDLER
///
/// What a registered object does with a call's marshalled body. No
/// implementation ships with this crate; generated stubs or
/// hand-written application objects are Non-goals of the engine itself
/// (spec §1).
pub trait ObjectHandler: Send + Sync {
  fn dispatch(&self, payload: &[u8]) -> Result<Vec<u8>, OrbError>;
}

struct BucketEntry {
  object_id: ObjectId,
  handler: Arc<dyn ObjectHandler>,
  entered: AtomicUsize,
  retiring: AtomicBool,
}

/// ## OBJECT REGISTRY
/// See the module documentation.
pub struct ObjectRegistry {
  buckets: Vec<Mutex<Vec<Arc<BucketEntry>>>>,
}

impl ObjectRegistry {
  pub fn new() -> Self {
    let mut buckets = Vec::with_capacity(BUCKET_COUNT);
    for _ in 0..BUCKET_COUNT {
      buckets.push(Mutex::new(Vec::new()));
    }
    Self { buckets }
  }

  /// ### REGISTER
  pub fn register(&self, object_id: ObjectId, handler: Arc<dyn ObjectHandler>) -> Result<(), OrbError> {
    let mut bucket = self.buckets[object_id.bucket_index()].lock().unwrap();
    if bucket.iter().any(|e| e.object_id == object_id) {
      return Err(OrbError::Duplicate);
    }
    bucket.push(Arc::new(BucketEntry { object_id, handler, entered: AtomicUsize::new(0), retiring: AtomicBool::new(false) }));
    Ok(())
  }

  /// ### DEREGISTER
  ///
  /// Removes `object_id` from lookup immediately, then blocks until its
  /// entered-count reaches zero or [DEREGISTER_TIMEOUT] elapses.
  pub fn deregister(&self, object_id: ObjectId) -> Result<(), OrbError> {
    let entry = {
      let mut bucket = self.buckets[object_id.bucket_index()].lock().unwrap();
      let position = bucket.iter().position(|e| e.object_id == object_id);
      match position {
        Some(index) => {
          let entry = bucket.remove(index);
          entry.retiring.store(true, Ordering::SeqCst);
          Some(entry)
        }
        None => None,
      }
    };
    let entry = entry.ok_or(OrbError::NotFound)?;

    let deadline = Instant::now() + DEREGISTER_TIMEOUT;
    while entry.entered.load(Ordering::SeqCst) > 0 {
      if Instant::now() >= deadline {
        return Err(OrbError::Timeout(DEREGISTER_TIMEOUT));
      }
      thread::sleep(DRAIN_POLL_INTERVAL);
    }
    Ok(())
  }

  /// ### DISPATCH
  ///
  /// Looks `object_id` up and marks it entered while still holding the
  /// bucket lock, so a concurrent [ObjectRegistry::deregister] can never
  /// observe an entered-count of zero and tear the entry down between
  /// the lookup and the increment. The handler itself still runs outside
  /// any lock. A deregister that has already started waits for this
  /// call to finish; it never aborts it mid-flight.
  pub fn dispatch(&self, object_id: ObjectId, payload: &[u8]) -> Result<Vec<u8>, OrbError> {
    let entry = {
      let bucket = self.buckets[object_id.bucket_index()].lock().unwrap();
      let entry = bucket.iter().find(|e| e.object_id == object_id && !e.retiring.load(Ordering::SeqCst)).cloned();
      if let Some(entry) = &entry {
        entry.entered.fetch_add(1, Ordering::SeqCst);
      }
      entry
    };
    let entry = entry.ok_or(OrbError::NotFound)?;
    let result = entry.handler.dispatch(payload);
    entry.entered.fetch_sub(1, Ordering::SeqCst);
    result
  }

  pub fn len(&self) -> usize {
    self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for ObjectRegistry {
  fn default() -> Self {
    Self::new()
  }
}
