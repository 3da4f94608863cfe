pub mod config;
pub mod proxy;
pub mod routes;

pub use config::{Config, LogFormat};
pub use proxy::{
    pump, DispatchError, HalfClose, Listener, ListenerConfig, ListenerStats, PumpStats, SniConfig,
    SniError, SniInspector, SniffedStream,
};
pub use routes::{
    BuildError, InboundRecord, InboundSource, ParsedTarget, RouteCache, RouteTable,
    RouteTableBuilder, SourceError, SqliteInboundSource,
};
