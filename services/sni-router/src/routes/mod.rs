//! Hostname to backend port routing.
//!
//! ```text
//! inbounds (SQLite) ──┐
//!                     ├─> RouteTableBuilder ──> RouteTable ──> RouteCache (ArcSwap)
//! override file ──────┘                                         │
//!                                   refresh every 30s ──────────┘
//! ```

mod builder;
mod overrides;
mod source;
mod table;

pub use builder::{BuildError, RouteTableBuilder};
pub use overrides::{
    load_overrides, parse_line, parse_overrides, LineError, OverrideEntry, DEFAULT_OVERRIDES_PATH,
};
pub use source::{
    split_host, InboundRecord, InboundSource, ParsedTarget, SourceError, SqliteInboundSource,
};
pub use table::{RouteCache, RouteTable, DEFAULT_RELOAD_INTERVAL};
