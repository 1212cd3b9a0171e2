//! # CLIENT RUNTIME
//! **Based on spec §4.3–4.5**
//!
//! Everything a proxy needs to make a call: a [ServerTarget] per
//! endpoint, a [ClientRegistry] that shares targets across proxies and
//! scavenges idle ones, and a [BindingCache] that spares most calls a
//! name-server round trip.

mod binding_cache;
mod registry;
mod target;
mod tuning;

pub use binding_cache::{BindingCache, Lookup, NAME_SERVER_BINDING};
pub use registry::ClientRegistry;
pub use target::ServerTarget;
pub use tuning::ClientTuning;
