//! Route table snapshots and the hot-reloadable cache that serves them.
//!
//! - Exact, case-sensitive hostname match only (no wildcards)
//! - A table is immutable once built; reloads publish a brand-new table
//! - Readers never block and never see a half-built table
//! - A failed reload keeps the last good table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::builder::{BuildError, RouteTableBuilder};

/// Default interval between route table rebuilds.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Immutable hostname to backend port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, u16>,
}

impl RouteTable {
    /// Look up the backend port for an exact hostname.
    pub fn get(&self, hostname: &str) -> Option<u16> {
        self.routes.get(hostname).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Entries sorted by hostname.
    pub fn entries(&self) -> Vec<(&str, u16)> {
        let mut entries: Vec<_> = self
            .routes
            .iter()
            .map(|(host, port)| (host.as_str(), *port))
            .collect();
        entries.sort_unstable();
        entries
    }
}

impl From<HashMap<String, u16>> for RouteTable {
    fn from(routes: HashMap<String, u16>) -> Self {
        Self { routes }
    }
}

impl<S: Into<String>> FromIterator<(S, u16)> for RouteTable {
    /// Later entries win on duplicate hostnames.
    fn from_iter<I: IntoIterator<Item = (S, u16)>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().map(|(h, p)| (h.into(), p)).collect(),
        }
    }
}

/// Holds the current [`RouteTable`] and swaps in rebuilt ones.
///
/// Uses ArcSwap for lock-free reads: `get` loads the current snapshot
/// pointer, `refresh` stores a new one in a single atomic swap.
pub struct RouteCache {
    table: ArcSwap<RouteTable>,
    builder: Arc<RouteTableBuilder>,
}

impl RouteCache {
    /// Build the first table and create the cache around it.
    ///
    /// Fails if that first build fails; there is no empty-cache state.
    pub async fn load(builder: Arc<RouteTableBuilder>) -> Result<Self, BuildError> {
        let table = build_blocking(Arc::clone(&builder)).await?;
        info!(route_count = table.len(), "Route table loaded");

        Ok(Self {
            table: ArcSwap::from_pointee(table),
            builder,
        })
    }

    /// Create a cache from an already built table.
    pub fn with_table(table: RouteTable, builder: Arc<RouteTableBuilder>) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            builder,
        }
    }

    /// Backend port for `hostname`, if routed.
    pub fn get(&self, hostname: &str) -> Option<u16> {
        self.table.load().get(hostname)
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Rebuild the table and publish it.
    ///
    /// On failure the current table stays in place and the error is
    /// returned to the caller for logging.
    pub async fn refresh(&self) -> Result<usize, BuildError> {
        let table = build_blocking(Arc::clone(&self.builder)).await?;
        let route_count = table.len();

        self.table.store(Arc::new(table));

        info!(route_count, "Route table updated");
        Ok(route_count)
    }

    /// Refresh every `period` for the life of the process.
    ///
    /// The first tick fires one `period` from now; the initial table is
    /// expected to come from [`RouteCache::load`].
    pub async fn run_refresh_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                error!(error = %e, "Route table reload failed; keeping previous table");
            }
        }
    }
}

/// Run a build on the blocking pool; the data source does synchronous I/O.
async fn build_blocking(builder: Arc<RouteTableBuilder>) -> Result<RouteTable, BuildError> {
    match tokio::task::spawn_blocking(move || builder.build()).await {
        Ok(result) => result,
        Err(e) => Err(BuildError::Aborted(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_entries_win() {
        let table: RouteTable = vec![("a.example.com", 10001), ("a.example.com", 10002)]
            .into_iter()
            .collect();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a.example.com"), Some(10002));
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let table: RouteTable = vec![("a.example.com", 10001)].into_iter().collect();

        assert_eq!(table.get("a.example.com"), Some(10001));
        assert_eq!(table.get("A.example.com"), None);
        assert_eq!(table.get("a.example.com."), None);
    }

    #[test]
    fn entries_are_sorted() {
        let table: RouteTable = vec![("b.test", 2), ("a.test", 1), ("c.test", 3)]
            .into_iter()
            .collect();

        assert_eq!(table.entries(), vec![("a.test", 1), ("b.test", 2), ("c.test", 3)]);
    }
}
