use std::time::Duration;

/// ## CLIENT TUNING
/// **Based on spec §6 (Configuration) and §4.3–4.5**
///
/// The timing knobs governing one client-side endpoint. Every field has
/// the default spec.md prescribes; `timeout_adjust` is the one value
/// meant to be overridden per-process (normally sourced from the
/// `CID_ORBTIMEOUTADJUST` environment variable by `orb-facility`) to
/// accommodate slow peers.
#[derive(Debug, Clone, Copy)]
pub struct ClientTuning {
  /// T5-equivalent: the connect timeout for a single attempt.
  pub connect_timeout: Duration,
  /// How long to wait for the 4-byte handshake status after connect.
  pub handshake_timeout: Duration,
  /// The ceiling on each spooler loop iteration's bounded wait.
  pub spooler_cycle: Duration,
  /// How long the spooler may go without sending before it must emit a
  /// keep-alive frame.
  pub keep_alive_interval: Duration,
  /// How long a zero-refcount `ServerTarget` lingers in the scavenger
  /// list before being destroyed.
  pub scavenger_retain: Duration,
  /// How often the scavenger task wakes to sweep expired entries.
  pub scavenger_interval: Duration,
  /// How long a connect-waiter will wait for an in-progress connect
  /// race to resolve before giving up.
  pub connect_waiter_timeout: Duration,
  /// The bound on simultaneously live binding-cache entries.
  pub binding_cache_cap: usize,
  /// The default lease duration for a binding-cache entry.
  pub binding_lease: Duration,
  /// The ceiling between forced name-server round-trips.
  pub forced_refresh: Duration,
  /// Added to every I/O timeout to accommodate slow peers.
  pub timeout_adjust: Duration,
}

impl Default for ClientTuning {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(3),
      handshake_timeout: Duration::from_secs(4),
      spooler_cycle: Duration::from_millis(250),
      keep_alive_interval: Duration::from_secs(30),
      scavenger_retain: Duration::from_secs(45),
      scavenger_interval: Duration::from_secs(2),
      connect_waiter_timeout: Duration::from_secs(5),
      binding_cache_cap: 2048,
      binding_lease: Duration::from_secs(50),
      forced_refresh: Duration::from_secs(30),
      timeout_adjust: Duration::ZERO,
    }
  }
}
