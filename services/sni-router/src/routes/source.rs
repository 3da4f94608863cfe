//! Inbound records from the x-ui SQLite database.
//!
//! The router only ever reads the `inbounds` table. Each row carries the
//! local port of a backend and its `stream_settings` JSON, whose
//! `realitySettings.target` names the public hostname it should serve.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const INBOUNDS_QUERY: &str = "SELECT port, stream_settings FROM inbounds";

/// Errors from an inbound data source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Data source unavailable: {0}")]
    Unavailable(String),
}

/// One row of the `inbounds` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    /// Local backend port as stored (validated when merged).
    pub port: i64,
    /// Raw `stream_settings` JSON; NULL in the database maps to `None`.
    pub stream_settings: Option<String>,
}

impl InboundRecord {
    pub fn new(port: i64, stream_settings: impl Into<String>) -> Self {
        Self {
            port,
            stream_settings: Some(stream_settings.into()),
        }
    }
}

/// Read-only source of inbound records.
pub trait InboundSource: Send + Sync {
    /// Load every inbound record. A failure aborts the whole build.
    fn load_inbounds(&self) -> Result<Vec<InboundRecord>, SourceError>;
}

/// Inbound source backed by an x-ui SQLite database.
pub struct SqliteInboundSource {
    conn: Mutex<Connection>,
}

impl SqliteInboundSource {
    /// Open the database at `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        debug!(path = %path.as_ref().display(), "Opened inbound database");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection (tests use in-memory databases).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl InboundSource for SqliteInboundSource {
    fn load_inbounds(&self) -> Result<Vec<InboundRecord>, SourceError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SourceError::Unavailable("connection lock poisoned".to_string()))?;

        let mut stmt = conn.prepare(INBOUNDS_QUERY)?;
        let rows = stmt.query_map([], |row| {
            Ok(InboundRecord {
                port: row.get(0)?,
                stream_settings: row.get(1)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamSettings {
    #[serde(rename = "realitySettings", default)]
    reality_settings: RealitySettings,
}

#[derive(Debug, Default, Deserialize)]
struct RealitySettings {
    #[serde(default)]
    target: String,
}

/// The routing-relevant part of a record's `stream_settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    /// `realitySettings.target` as written (`host:port` or a bare host).
    pub target: String,
}

impl ParsedTarget {
    /// Decode `stream_settings` JSON.
    pub fn parse(stream_settings: &str) -> Result<Self, serde_json::Error> {
        let settings: StreamSettings = serde_json::from_str(stream_settings)?;
        Ok(Self {
            target: settings.reality_settings.target,
        })
    }

    /// Hostname to route on: the host part of `host:port`, or the whole
    /// target when it does not split.
    pub fn host(&self) -> &str {
        split_host(&self.target).unwrap_or(&self.target)
    }
}

/// Split `host:port` / `[host]:port` and return the host.
///
/// Returns `None` when the string is not in that shape (no port, too many
/// colons, stray brackets).
pub fn split_host(target: &str) -> Option<&str> {
    let colon = target.rfind(':')?;
    let (host, _port) = (&target[..colon], &target[colon + 1..]);

    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        if inner.contains(['[', ']']) {
            return None;
        }
        return Some(inner);
    }

    if host.contains([':', '[', ']']) {
        return None;
    }

    Some(host)
}
