//! # CONFIGURATION
//! **Based on spec §6**
//!
//! A flat, `Default`-backed settings struct. The only environment
//! override is `CID_ORBTIMEOUTADJUST`, read once at [Config::default]
//! time; a value that fails to parse falls back to 5000 ms rather than
//! aborting startup.

use std::time::Duration;

use orb_client::ClientTuning;

/// ## CONFIG
pub struct Config {
  pub client_tuning: ClientTuning,
  pub worker_baseline: usize,
  pub worker_cap: usize,
  pub connection_cap: usize,
}

impl Default for Config {
  fn default() -> Self {
    let mut client_tuning = ClientTuning::default();
    client_tuning.timeout_adjust = read_timeout_adjust();
    Self {
      client_tuning,
      worker_baseline: orb_server::DEFAULT_BASELINE,
      worker_cap: orb_server::DEFAULT_CAP,
      connection_cap: orb_server::MAX_CONNECTION_CAP,
    }
  }
}

fn read_timeout_adjust() -> Duration {
  match std::env::var("CID_ORBTIMEOUTADJUST") {
    Err(_) => Duration::ZERO,
    Ok(raw) => match raw.parse::<u64>() {
      Ok(millis) => Duration::from_millis(millis),
      Err(_) => {
        tracing::warn!(raw, "malformed CID_ORBTIMEOUTADJUST; falling back to 5000ms");
        Duration::from_millis(5000)
      }
    },
  }
}
