//! Route table construction.
//!
//! Database routes are merged first, override file routes second, so an
//! override always wins for a hostname present in both.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use super::overrides::load_overrides;
use super::source::{InboundRecord, InboundSource, ParsedTarget, SourceError};
use super::table::RouteTable;

/// Errors that abort a whole build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to query inbounds: {0}")]
    Source(#[from] SourceError),

    #[error("failed to read override file {}: {source}", .path.display())]
    Overrides {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("route table build aborted: {0}")]
    Aborted(String),
}

/// Builds [`RouteTable`]s from an inbound source and an override file.
pub struct RouteTableBuilder {
    source: Box<dyn InboundSource>,
    overrides_path: PathBuf,
}

impl RouteTableBuilder {
    pub fn new(source: Box<dyn InboundSource>, overrides_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            overrides_path: overrides_path.into(),
        }
    }

    /// Build a complete table.
    ///
    /// Malformed records and override lines are skipped; a source query
    /// failure or an unreadable override file aborts the build.
    pub fn build(&self) -> Result<RouteTable, BuildError> {
        let mut routes = HashMap::new();

        for record in self.source.load_inbounds()? {
            if let Some((host, port)) = route_from_record(&record) {
                routes.insert(host, port);
            }
        }

        let overrides =
            load_overrides(&self.overrides_path).map_err(|source| BuildError::Overrides {
                path: self.overrides_path.clone(),
                source,
            })?;

        for entry in overrides {
            routes.insert(entry.host, entry.port);
        }

        Ok(RouteTable::from(routes))
    }
}

/// Derive a `(host, port)` route from one inbound record, if it has one.
fn route_from_record(record: &InboundRecord) -> Option<(String, u16)> {
    let Some(raw) = record.stream_settings.as_deref() else {
        warn!(port = record.port, "Skipping inbound without stream settings");
        return None;
    };

    let parsed = match ParsedTarget::parse(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(port = record.port, error = %e, "Skipping inbound with bad stream settings JSON");
            return None;
        }
    };

    let host = parsed.host();
    if host.is_empty() {
        debug!(port = record.port, "Inbound has no reality target");
        return None;
    }
    if host.len() == parsed.target.len() && parsed.target.contains(':') {
        warn!(
            port = record.port,
            target = %parsed.target,
            "Could not split reality target; using it as the host"
        );
    }

    let Some(port) = u16::try_from(record.port).ok().filter(|p| *p != 0) else {
        warn!(port = record.port, host, "Skipping inbound with out-of-range port");
        return None;
    };

    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct StaticSource(Vec<InboundRecord>);

    impl InboundSource for StaticSource {
        fn load_inbounds(&self) -> Result<Vec<InboundRecord>, SourceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    impl InboundSource for FailingSource {
        fn load_inbounds(&self) -> Result<Vec<InboundRecord>, SourceError> {
            Err(SourceError::Unavailable("database is locked".to_string()))
        }
    }

    fn reality(target: &str) -> String {
        format!(r#"{{"network":"tcp","realitySettings":{{"show":false,"target":"{target}"}}}}"#)
    }

    fn builder(records: Vec<InboundRecord>, overrides: Option<&str>) -> (RouteTableBuilder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        if let Some(content) = overrides {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(content.as_bytes()).unwrap();
        }
        (RouteTableBuilder::new(Box::new(StaticSource(records)), path), dir)
    }

    #[test]
    fn builds_from_database_records() {
        let (builder, _dir) = builder(
            vec![
                InboundRecord::new(10001, reality("a.example.com:443")),
                InboundRecord::new(10002, reality("b.example.com")),
            ],
            None,
        );

        let table = builder.build().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a.example.com"), Some(10001));
        assert_eq!(table.get("b.example.com"), Some(10002));
    }

    #[test]
    fn skips_malformed_records() {
        let (builder, _dir) = builder(
            vec![
                InboundRecord::new(10001, "{broken"),
                InboundRecord {
                    port: 10002,
                    stream_settings: None,
                },
                InboundRecord::new(10003, r#"{"network":"ws"}"#),
                InboundRecord::new(70000, reality("big.example.com:443")),
                InboundRecord::new(10004, reality("ok.example.com:443")),
            ],
            None,
        );

        let table = builder.build().unwrap();
        assert_eq!(table.entries(), vec![("ok.example.com", 10004)]);
    }

    #[test]
    fn non_utf8_override_bytes_do_not_abort_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, b"# caf\xe9\na.example.com 20001\n").unwrap();
        let builder = RouteTableBuilder::new(
            Box::new(StaticSource(vec![InboundRecord::new(
                10002,
                reality("b.example.com:443"),
            )])),
            path,
        );

        let table = builder.build().unwrap();
        assert_eq!(
            table.entries(),
            vec![("a.example.com", 20001), ("b.example.com", 10002)]
        );
    }

    #[test]
    fn overrides_win_over_database() {
        let (builder, _dir) = builder(
            vec![
                InboundRecord::new(10001, reality("a.example.com:443")),
                InboundRecord::new(10002, reality("b.example.com:443")),
            ],
            Some("# local\na.example.com 20001\nc.example.com 20003\n"),
        );

        let table = builder.build().unwrap();
        assert_eq!(table.get("a.example.com"), Some(20001));
        assert_eq!(table.get("b.example.com"), Some(10002));
        assert_eq!(table.get("c.example.com"), Some(20003));
    }

    #[test]
    fn malformed_override_lines_do_not_change_count() {
        let (builder, _dir) = builder(
            vec![InboundRecord::new(10001, reality("a.example.com:443"))],
            Some("bad line here\nd.example.com port\nlonely\nd.example.com 20004\n"),
        );

        let table = builder.build().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("d.example.com"), Some(20004));
    }

    #[test]
    fn source_failure_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        let builder = RouteTableBuilder::new(Box::new(FailingSource), dir.path().join("config"));

        assert!(matches!(builder.build(), Err(BuildError::Source(_))));
    }

    #[test]
    fn unreadable_override_file_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        // Point the override path at a directory.
        let builder = RouteTableBuilder::new(Box::new(StaticSource(Vec::new())), dir.path());

        assert!(matches!(builder.build(), Err(BuildError::Overrides { .. })));
    }
}
