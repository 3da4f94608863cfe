
use std::sync::Arc;
use std::time::Duration;

use harness::{overrides_file, reality_record, ScriptedSource};
use rusqlite::Connection;
use sni_router::{BuildError, RouteCache, RouteTableBuilder, SqliteInboundSource};

fn cache_builder(source: &ScriptedSource, overrides: &std::path::Path) -> Arc<RouteTableBuilder> {
    Arc::new(RouteTableBuilder::new(Box::new(source.clone()), overrides))
}

#[tokio::test]
async fn initial_load_fails_without_data_source() {
    let source = ScriptedSource::default();
    source.fail();
    let (_dir, overrides) = overrides_file(None);

    let result = RouteCache::load(cache_builder(&source, &overrides)).await;
    assert!(matches!(result, Err(BuildError::Source(_))));
}

#[tokio::test]
async fn refresh_publishes_new_table() {
    let source = ScriptedSource::new(vec![reality_record(10001, "a.example.com:443")]);
    let (_dir, overrides) = overrides_file(None);

    let cache = RouteCache::load(cache_builder(&source, &overrides))
        .await
        .unwrap();
    assert_eq!(cache.get("a.example.com"), Some(10001));

    source.set(vec![
        reality_record(10002, "a.example.com:443"),
        reality_record(10003, "b.example.com"),
    ]);
    assert_eq!(cache.refresh().await.unwrap(), 2);

    assert_eq!(cache.get("a.example.com"), Some(10002));
    assert_eq!(cache.get("b.example.com"), Some(10003));
}

#[tokio::test]
async fn failed_refresh_keeps_previous_table() {
    let source = ScriptedSource::new(vec![reality_record(10001, "a.example.com:443")]);
    let (_dir, overrides) = overrides_file(None);

    let cache = RouteCache::load(cache_builder(&source, &overrides))
        .await
        .unwrap();
    let before = cache.snapshot();

    source.fail();
    assert!(cache.refresh().await.is_err());

    assert_eq!(cache.get("a.example.com"), Some(10001));
    assert!(Arc::ptr_eq(&before, &cache.snapshot()));
}

#[tokio::test]
async fn unreadable_overrides_keep_previous_table() {
    let source = ScriptedSource::new(vec![reality_record(10001, "a.example.com:443")]);
    let (dir, overrides) = overrides_file(None);

    let cache = RouteCache::load(cache_builder(&source, &overrides))
        .await
        .unwrap();

    // Replace the override path with a directory: reading it now fails.
    std::fs::create_dir(&overrides).unwrap();
    source.set(vec![reality_record(10009, "a.example.com:443")]);

    assert!(matches!(
        cache.refresh().await,
        Err(BuildError::Overrides { .. })
    ));
    assert_eq!(cache.get("a.example.com"), Some(10001));
    drop(dir);
}

#[tokio::test]
async fn overrides_take_precedence_on_reload() {
    let source = ScriptedSource::new(vec![
        reality_record(10001, "a.example.com:443"),
        reality_record(10002, "b.example.com:443"),
    ]);
    let (_dir, overrides) = overrides_file(Some(
        "# pinned\na.example.com 20001\nnot a valid line\nc.example.com 20003\n",
    ));

    let cache = RouteCache::load(cache_builder(&source, &overrides))
        .await
        .unwrap();

    assert_eq!(cache.get("a.example.com"), Some(20001));
    assert_eq!(cache.get("b.example.com"), Some(10002));
    assert_eq!(cache.get("c.example.com"), Some(20003));
    assert_eq!(cache.snapshot().len(), 3);
}

#[tokio::test]
async fn refresh_loop_picks_up_changes() {
    let source = ScriptedSource::new(vec![reality_record(10001, "a.example.com:443")]);
    let (_dir, overrides) = overrides_file(None);

    let cache = Arc::new(
        RouteCache::load(cache_builder(&source, &overrides))
            .await
            .unwrap(),
    );
    let refresher = tokio::spawn(Arc::clone(&cache).run_refresh_loop(Duration::from_millis(20)));

    source.set(vec![reality_record(10005, "a.example.com:443")]);

    let mut seen = None;
    for _ in 0..200 {
        seen = cache.get("a.example.com");
        if seen == Some(10005) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(10005));

    refresher.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_during_refreshes() {
    let source = ScriptedSource::new(vec![reality_record(10001, "a.example.com:443")]);
    let (_dir, overrides) = overrides_file(None);

    let cache = Arc::new(
        RouteCache::load(cache_builder(&source, &overrides))
            .await
            .unwrap(),
    );

    let mut readers = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        readers.push(tokio::spawn(async move {
            for _ in 0..2_000 {
                let table = cache.snapshot();
                // Every snapshot is one whole table: both hosts agree.
                let a = table.get("a.example.com");
                let b = table.get("b.example.com");
                match (a, b) {
                    (Some(10001), None) | (Some(10002), Some(10002)) => {}
                    other => panic!("torn or missing table: {other:?}"),
                }
                assert!(cache.get("a.example.com").is_some());
                tokio::task::yield_now().await;
            }
        }));
    }

    for round in 0..50 {
        if round % 2 == 0 {
            source.set(vec![
                reality_record(10002, "a.example.com:443"),
                reality_record(10002, "b.example.com:443"),
            ]);
        } else if round % 5 == 0 {
            source.fail();
        } else {
            source.set(vec![reality_record(10001, "a.example.com:443")]);
        }
        let _ = cache.refresh().await;
    }

    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn sqlite_database_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("x-ui.db");

    let conn = Connection::open(&db_path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE inbounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            port INTEGER,
            protocol TEXT,
            stream_settings TEXT
        );
        INSERT INTO inbounds (port, protocol, stream_settings) VALUES
            (10001, 'vless', '{"network":"tcp","security":"reality","realitySettings":{"target":"a.example.com:443"}}'),
            (10002, 'vless', '{"network":"tcp","security":"reality","realitySettings":{"target":"b.example.com"}}'),
            (10003, 'vmess', '{"network":"ws","security":"none"}'),
            (10004, 'vless', 'not json');
        "#,
    )
    .unwrap();
    drop(conn);

    let (_overrides_dir, overrides) = overrides_file(Some("b.example.com 20002\n"));
    let source = SqliteInboundSource::open(&db_path).unwrap();
    let builder = Arc::new(RouteTableBuilder::new(Box::new(source), overrides));

    let cache = RouteCache::load(builder).await.unwrap();
    let table = cache.snapshot();

    assert_eq!(
        table.entries(),
        vec![("a.example.com", 10001), ("b.example.com", 20002)]
    );
}

#[test]
fn sqlite_source_missing_database_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SqliteInboundSource::open(dir.path().join("missing.db")).is_err());
}
