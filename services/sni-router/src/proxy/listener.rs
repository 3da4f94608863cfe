//! TCP listener and per-connection dispatch.
//!
//! Each accepted connection runs on its own task:
//!
//! ```text
//! Accepted -> Sniffing -> Routed -> BackendConnecting -> Proxying -> Closed
//! ```
//!
//! Any step may end the connection early. Failures close that connection
//! only; the accept loop keeps going unless the listener itself breaks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::pump::pump;
use super::sni::{SniConfig, SniError, SniInspector};
use crate::routes::RouteCache;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 443);

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Backends are always local.
pub const BACKEND_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Optional cap on concurrently handled connections (unbounded if `None`).
    pub max_connections: Option<usize>,
    /// SNI inspection configuration (the timeout is the handshake deadline).
    pub sni_config: SniConfig,
    /// Timeout for dialing a backend.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: None,
            sni_config: SniConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDR)
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Sniff failures (timeout, not TLS, malformed).
    pub sniff_failed: AtomicU64,
    /// Routing successes.
    pub routes_matched: AtomicU64,
    /// Routing failures (no SNI, unknown host).
    pub routes_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Why a connection was closed before or during proxying.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sniff failed: {0}")]
    Sniff(#[from] SniError),

    #[error("ClientHello has no SNI")]
    NoSni,

    #[error("no route for SNI {hostname}")]
    NoRoute { hostname: String },

    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to backend {addr} after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },
}

impl DispatchError {
    /// Log at the level matching how expected the failure is.
    ///
    /// Called inside the connection span, which carries the peer address.
    fn log(&self) {
        match self {
            Self::Sniff(_) => {
                debug!(error = %self, "Not a routable TLS connection")
            }
            Self::NoSni | Self::NoRoute { .. } => {
                warn!(error = %self, "Connection not routed")
            }
            Self::Connect { .. } | Self::ConnectTimeout { .. } => {
                error!(error = %self, "Backend unavailable")
            }
        }
    }
}

/// A TCP listener that routes TLS connections by SNI.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Route lookups.
    routes: Arc<RouteCache>,
    /// Connection semaphore when a connection cap is configured.
    conn_semaphore: Option<Arc<Semaphore>>,
    /// SNI inspector.
    sni_inspector: SniInspector,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, routes: Arc<RouteCache>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            sni_inspector: SniInspector::with_config(config.sni_config.clone()),
            listener,
            config,
            routes,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    ///
    /// Only returns on a listener-level accept error.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => match classify_accept_error(&e) {
                    AcceptError::Transient => {
                        debug!(error = %e, "Transient accept error");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                    AcceptError::Exhausted => {
                        error!(error = %e, "Accept error: out of resources");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    AcceptError::Fatal => {
                        error!(error = %e, "Listener failed");
                        return Err(e);
                    }
                },
            };

            let permit = match &self.conn_semaphore {
                Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        self.stats
                            .connections_rejected
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                        continue;
                    }
                },
                None => None,
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let listener = Arc::clone(&self);

            tokio::spawn(
                async move {
                    if let Err(e) = listener.handle_connection(stream).await {
                        e.log();
                    }

                    listener
                        .stats
                        .connections_active
                        .fetch_sub(1, Ordering::Relaxed);
                    listener
                        .stats
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer_addr = %peer_addr)),
            );
        }
    }

    /// Handle a single connection from sniff to close.
    async fn handle_connection(&self, client: TcpStream) -> Result<(), DispatchError> {
        // Sniffing: bounded by the SNI timeout; no deadline afterwards.
        let (client, sni) = match self.sni_inspector.sniff(client).await {
            Ok(sniffed) => sniffed,
            Err(e) => {
                self.stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        // Routed
        let Some(hostname) = sni else {
            self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::NoSni);
        };
        let Some(backend_port) = self.routes.get(&hostname) else {
            self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::NoRoute { hostname });
        };
        self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);

        // BackendConnecting
        let backend_addr = SocketAddr::from((BACKEND_HOST, backend_port));
        let backend = match timeout(self.config.connect_timeout, TcpStream::connect(backend_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::Connect {
                    addr: backend_addr,
                    source,
                });
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::ConnectTimeout {
                    addr: backend_addr,
                    timeout: self.config.connect_timeout,
                });
            }
        };
        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);

        info!(
            sni = %hostname,
            backend_addr = %backend_addr,
            "Routing connection"
        );

        // Proxying; both streams are dropped (closed) when the pump returns.
        let stats = pump(client, backend).await;

        self.stats
            .bytes_to_backend
            .fetch_add(stats.client_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(stats.backend_to_client, Ordering::Relaxed);

        debug!(
            bytes_to_backend = stats.client_to_backend,
            bytes_from_backend = stats.backend_to_client,
            "Connection closed"
        );

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// Per-connection hiccup; retry right away.
    Transient,
    /// Out of descriptors or buffers; back off and retry.
    Exhausted,
    /// The listener itself is broken.
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptError::Transient,
        io::ErrorKind::OutOfMemory => return AcceptError::Exhausted,
        _ => {}
    }

    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        if matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        ) {
            return AcceptError::Exhausted;
        }
        if matches!(code, libc::EPROTO | libc::EPERM | libc::ENETDOWN | libc::EHOSTUNREACH) {
            return AcceptError::Transient;
        }
    }

    AcceptError::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert_eq!(config.bind_addr.port(), 443);
        assert!(config.max_connections.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.sni_config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn accept_errors_are_classified() {
        let reset = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&reset), AcceptError::Transient);

        #[cfg(unix)]
        {
            let emfile = io::Error::from_raw_os_error(libc::EMFILE);
            assert_eq!(classify_accept_error(&emfile), AcceptError::Exhausted);

            let ebadf = io::Error::from_raw_os_error(libc::EBADF);
            assert_eq!(classify_accept_error(&ebadf), AcceptError::Fatal);
        }
    }
}
