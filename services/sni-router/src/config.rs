//! Router configuration.
//!
//! Every option is a command-line flag with an `SNI_ROUTER_*` environment
//! fallback.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::proxy::{
    ListenerConfig, SniConfig, DEFAULT_BIND_ADDR, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SNIFF_TIMEOUT,
};
use crate::routes::{DEFAULT_OVERRIDES_PATH, DEFAULT_RELOAD_INTERVAL};

/// Default path of the x-ui database.
pub const DEFAULT_DB_PATH: &str = "/etc/x-ui/x-ui.db";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// SNI router - route TLS connections to local backends by SNI hostname.
#[derive(Debug, Clone, Parser)]
#[command(name = "sni-router")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the x-ui SQLite database.
    #[arg(long, alias = "db_path", env = "SNI_ROUTER_DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Override file with `<host> <port>` lines; may be absent.
    #[arg(long, env = "SNI_ROUTER_OVERRIDES", default_value = DEFAULT_OVERRIDES_PATH)]
    pub overrides: PathBuf,

    /// Address to accept TLS connections on.
    #[arg(long, env = "SNI_ROUTER_LISTEN", default_value_t = DEFAULT_BIND_ADDR)]
    pub listen: SocketAddr,

    /// Seconds between route table reloads.
    #[arg(
        long,
        env = "SNI_ROUTER_RELOAD_INTERVAL_SECS",
        default_value_t = DEFAULT_RELOAD_INTERVAL.as_secs()
    )]
    pub reload_interval_secs: u64,

    /// Milliseconds allowed for the client to deliver its ClientHello.
    #[arg(
        long,
        env = "SNI_ROUTER_SNIFF_TIMEOUT_MS",
        default_value_t = DEFAULT_SNIFF_TIMEOUT.as_millis() as u64
    )]
    pub sniff_timeout_ms: u64,

    /// Milliseconds allowed for connecting to a backend.
    #[arg(
        long,
        env = "SNI_ROUTER_CONNECT_TIMEOUT_MS",
        default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    )]
    pub connect_timeout_ms: u64,

    /// Cap on concurrently handled connections (unbounded when unset).
    #[arg(long, env = "SNI_ROUTER_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SNI_ROUTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SNI_ROUTER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Build the route table once, print it and exit.
    #[arg(long)]
    pub check: bool,
}

impl Config {
    /// Interval between route table reloads (at least one second).
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    /// Listener settings derived from the flags.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen);
        config.max_connections = self.max_connections.filter(|n| *n > 0);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms.max(1));
        config.sni_config = SniConfig {
            timeout: Duration::from_millis(self.sniff_timeout_ms.max(1)),
            ..SniConfig::default()
        };
        config
    }
}
