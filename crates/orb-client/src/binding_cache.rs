//! # BINDING-NAME CACHE
//! **Based on spec §4.5**
//!
//! Caches the [ObjectLocator] a binding name last resolved to, so a
//! proxy does not round-trip to a name server on every call. Entries
//! carry a 50-second lease. A single cache-wide forced-refresh deadline
//! (distinct from any entry's lease) forces a periodic miss on lookup so
//! a caller eventually re-resolves and notices a name-server restart;
//! the pseudo-binding used to look up the name server itself is exempt,
//! since the name server cannot be used to refresh knowledge of its own
//! address. A name-server cookie flip flushes the whole cache at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use orb_ids::ObjectLocator;

use crate::tuning::ClientTuning;

/// The pseudo-binding name used to look up the name server's own
/// locator; exempt from the forced-refresh miss since there is no other
/// server to resolve it with.
pub const NAME_SERVER_BINDING: &str = "$name-server";

struct CacheEntry {
  locator: ObjectLocator,
  fetched_at: Instant,
}

/// The result of a [BindingCache::lookup].
pub enum Lookup {
  /// Present, not expired, and the forced-refresh deadline has not
  /// elapsed: use directly.
  Fresh(ObjectLocator),
  /// Not cached, the lease has expired, or the forced-refresh deadline
  /// has elapsed: the caller must resolve before using the binding.
  Expired,
}

struct State {
  entries: HashMap<String, CacheEntry>,
  forced_refresh_deadline: Instant,
  last_cookie: Option<u64>,
}

/// ## BINDING CACHE
/// See the module documentation.
pub struct BindingCache {
  cap: usize,
  lease: Duration,
  forced_refresh_period: Duration,
  state: Mutex<State>,
}

impl BindingCache {
  pub fn new(tuning: &ClientTuning) -> Self {
    Self {
      cap: tuning.binding_cache_cap,
      lease: tuning.binding_lease,
      forced_refresh_period: tuning.forced_refresh,
      state: Mutex::new(State {
        entries: HashMap::new(),
        forced_refresh_deadline: Instant::now() + tuning.forced_refresh,
        last_cookie: None,
      }),
    }
  }

  /// ### LOOKUP
  ///
  /// Past the forced-refresh deadline, every binding but
  /// [NAME_SERVER_BINDING] misses outright and the deadline advances
  /// another `forced_refresh_period`, which is what forces the periodic
  /// name-server round trip, independent of any entry's own lease.
  /// Otherwise returns the entry if present and within its lease.
  pub fn lookup(&self, name: &str) -> Lookup {
    let mut state = self.state.lock().unwrap();
    if name != NAME_SERVER_BINDING && Instant::now() > state.forced_refresh_deadline {
      state.forced_refresh_deadline = Instant::now() + self.forced_refresh_period;
      return Lookup::Expired;
    }
    match state.entries.get(name) {
      Some(entry) if entry.fetched_at.elapsed() < self.lease => Lookup::Fresh(entry.locator.clone()),
      _ => Lookup::Expired,
    }
  }

  /// ### REFRESH
  ///
  /// If `name` is already cached with a locator equal to `locator`,
  /// extends its lease to `now + lease` without disturbing anything
  /// else. Otherwise behaves like [BindingCache::store] (the locator
  /// changed, or the binding is new).
  pub fn refresh(&self, name: impl Into<String>, locator: ObjectLocator) {
    let name = name.into();
    let mut state = self.state.lock().unwrap();
    if let Some(entry) = state.entries.get_mut(&name) {
      if entry.locator == locator {
        entry.fetched_at = Instant::now();
        return;
      }
    }
    drop(state);
    self.store(name, locator);
  }

  /// ### STORE
  ///
  /// Records a freshly resolved binding. If the cache is at capacity and
  /// `name` is not already present, expired entries are swept first;
  /// if that is not enough to make room, the entire cache is cleared
  /// (bounded degradation under pathological load, spec §4.5).
  pub fn store(&self, name: impl Into<String>, locator: ObjectLocator) {
    let name = name.into();
    let mut state = self.state.lock().unwrap();
    if state.entries.len() >= self.cap && !state.entries.contains_key(&name) {
      let lease = self.lease;
      state.entries.retain(|_, entry| entry.fetched_at.elapsed() < lease);
      if state.entries.len() >= self.cap {
        state.entries.clear();
      }
    }
    state.entries.insert(name, CacheEntry { locator, fetched_at: Instant::now() });
  }

  /// ### COOKIE CHECK
  ///
  /// When a caller reports a name-server cookie differing from the last
  /// one observed, flushes the entire cache, stores the new cookie, and
  /// advances the forced-refresh deadline (since the flush already
  /// forces every binding to miss once, an immediate second round trip
  /// is unnecessary). Returns `true` if the cookie had in fact changed.
  pub fn note_cookie(&self, observed_cookie: u64) -> bool {
    let mut state = self.state.lock().unwrap();
    if state.last_cookie == Some(observed_cookie) {
      return false;
    }
    state.last_cookie = Some(observed_cookie);
    state.entries.clear();
    state.forced_refresh_deadline = Instant::now() + self.forced_refresh_period;
    true
  }

  /// Purges the entry for `name`, if any.
  pub fn invalidate(&self, name: &str) {
    self.state.lock().unwrap().entries.remove(name);
  }

  /// Purges every entry whose locator equals `locator` (e.g. the
  /// object behind it was deregistered and its locator is now stale no
  /// matter which binding name reaches it).
  pub fn invalidate_by_locator(&self, locator: &ObjectLocator) {
    self.state.lock().unwrap().entries.retain(|_, entry| &entry.locator != locator);
  }

  pub fn len(&self) -> usize {
    self.state.lock().unwrap().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use orb_ids::ObjectId;

  fn locator() -> ObjectLocator {
    ObjectLocator::new(ObjectId::new(1, 2), "svc.internal", 9000, "default")
  }

  fn other_locator() -> ObjectLocator {
    ObjectLocator::new(ObjectId::new(3, 4), "svc.internal", 9001, "default")
  }

  fn tuning_with(lease: Duration, forced_refresh: Duration, cap: usize) -> ClientTuning {
    let mut tuning = ClientTuning::default();
    tuning.binding_lease = lease;
    tuning.forced_refresh = forced_refresh;
    tuning.binding_cache_cap = cap;
    tuning
  }

  #[test]
  fn fresh_entry_is_returned_directly() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_secs(30), 2048));
    cache.store("svc", locator());
    assert!(matches!(cache.lookup("svc"), Lookup::Fresh(_)));
  }

  #[test]
  fn entry_past_lease_is_expired() {
    let cache = BindingCache::new(&tuning_with(Duration::from_millis(30), Duration::from_secs(30), 2048));
    cache.store("svc", locator());
    std::thread::sleep(Duration::from_millis(60));
    assert!(matches!(cache.lookup("svc"), Lookup::Expired));
  }

  #[test]
  fn past_forced_refresh_deadline_every_binding_but_name_server_misses() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_millis(20), 2048));
    cache.store("svc", locator());
    cache.store(NAME_SERVER_BINDING, locator());
    std::thread::sleep(Duration::from_millis(40));
    assert!(matches!(cache.lookup("svc"), Lookup::Expired), "ordinary bindings miss once the forced-refresh deadline passes");
    assert!(matches!(cache.lookup(NAME_SERVER_BINDING), Lookup::Fresh(_)), "the name server's own binding is exempt");
  }

  #[test]
  fn refresh_extends_lease_when_locator_is_unchanged() {
    let cache = BindingCache::new(&tuning_with(Duration::from_millis(100), Duration::from_secs(30), 2048));
    cache.store("svc", locator());
    std::thread::sleep(Duration::from_millis(60));
    cache.refresh("svc", locator());
    std::thread::sleep(Duration::from_millis(60));
    assert!(matches!(cache.lookup("svc"), Lookup::Fresh(_)), "refresh should have pushed the lease out past the first sleep");
  }

  #[test]
  fn refresh_replaces_entry_when_locator_changed() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_secs(30), 2048));
    cache.store("svc", locator());
    cache.refresh("svc", other_locator());
    match cache.lookup("svc") {
      Lookup::Fresh(found) => assert_eq!(found, other_locator()),
      Lookup::Expired => panic!("expected a fresh entry after refresh"),
    }
  }

  #[test]
  fn store_sweeps_expired_entries_before_clearing_at_capacity() {
    let cache = BindingCache::new(&tuning_with(Duration::from_millis(20), Duration::from_secs(30), 2));
    cache.store("a", locator());
    std::thread::sleep(Duration::from_millis(40)); // "a" is now expired by lease
    cache.store("b", locator());
    cache.store("c", locator()); // room is made by sweeping "a", not by clearing
    assert_eq!(cache.len(), 2);
    assert!(matches!(cache.lookup("b"), Lookup::Fresh(_)));
    assert!(matches!(cache.lookup("c"), Lookup::Fresh(_)));
  }

  #[test]
  fn store_clears_entire_cache_when_sweep_is_not_enough() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_secs(30), 2));
    cache.store("a", locator());
    cache.store("b", locator());
    cache.store("c", locator()); // nothing expired to sweep, so the cache clears
    assert_eq!(cache.len(), 1);
    assert!(matches!(cache.lookup("a"), Lookup::Expired));
    assert!(matches!(cache.lookup("c"), Lookup::Fresh(_)));
  }

  #[test]
  fn cookie_change_flushes_whole_cache_and_advances_deadline() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_millis(20), 2048));
    cache.store("a", locator());
    cache.store("b", other_locator());
    assert!(cache.note_cookie(7));
    assert!(cache.is_empty());
    assert!(matches!(cache.lookup("a"), Lookup::Expired));

    std::thread::sleep(Duration::from_millis(40));
    cache.store("a", locator());
    // the deadline was pushed out by the cookie flip, so this lookup should not also miss on the forced-refresh path
    assert!(matches!(cache.lookup("a"), Lookup::Fresh(_)));
  }

  #[test]
  fn matching_cookie_does_not_flush() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_secs(30), 2048));
    cache.store("a", locator());
    assert!(cache.note_cookie(1));
    assert!(!cache.note_cookie(1));
    assert!(matches!(cache.lookup("a"), Lookup::Fresh(_)));
  }

  #[test]
  fn invalidate_by_locator_purges_all_matching_entries() {
    let cache = BindingCache::new(&tuning_with(Duration::from_secs(50), Duration::from_secs(30), 2048));
    cache.store("a", locator());
    cache.store("b", locator());
    cache.store("c", other_locator());
    cache.invalidate_by_locator(&locator());
    assert!(matches!(cache.lookup("a"), Lookup::Expired));
    assert!(matches!(cache.lookup("b"), Lookup::Expired));
    assert!(matches!(cache.lookup("c"), Lookup::Fresh(_)));
  }
}
