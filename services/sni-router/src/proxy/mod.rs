//! L4 TLS passthrough proxy.
//!
//! This module provides:
//! - TCP listener and per-connection dispatch
//! - SNI inspection with byte-exact replay
//! - Bidirectional copying with half-close propagation
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SNI Inspector -> RouteCache -> 127.0.0.1:<port>
//!                             |                              |
//!                       SniffedStream  <------ pump ------>  Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sni_router::{Listener, ListenerConfig};
//!
//! let config = ListenerConfig::new("0.0.0.0:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, route_cache).await?);
//! listener.run().await?;
//! ```

mod listener;
mod pump;
mod sni;

pub use listener::{
    DispatchError, Listener, ListenerConfig, ListenerStats, BACKEND_HOST, DEFAULT_BIND_ADDR,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use pump::{pump, HalfClose, PumpStats};
pub use sni::{
    SniConfig, SniError, SniInspector, SniffedStream, DEFAULT_MAX_SNIFF_BYTES,
    DEFAULT_SNIFF_TIMEOUT, MAX_RECORD_LEN,
};
