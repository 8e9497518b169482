//! Cache behaviour across launcher restarts and between instances

mod common;

use common::MemoryOrigin;
use gamebox::cache::populate::populate_redirects;
use gamebox::cache::{Cache, CacheOptions};
use gamebox::config::settings::{Redirect, UrlMapSettings};
use gamebox::config::types::{Freshness, LauncherError};
use gamebox::config::url_map::UrlMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn open(dir: &Path, origin: Arc<MemoryOrigin>) -> gamebox::Result<Cache> {
    Cache::open(CacheOptions::new(dir, origin))
}

#[test]
fn test_index_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::default());
    origin.serve("http://games.example.org/a/game.zip", b"archive");
    origin.serve("http://games.example.org/a/", b"<html>");

    let uri = Url::parse("http://games.example.org/a/game.zip").unwrap();
    {
        let cache = open(dir.path(), origin.clone()).unwrap();
        let archive = cache.get_resource(uri.clone(), true).unwrap();
        assert_eq!(archive.read_bytes().unwrap(), b"archive");
        let page = cache
            .get_resource(Url::parse("http://games.example.org/a/").unwrap(), false)
            .unwrap();
        page.read().unwrap();
    }
    assert_eq!(origin.calls(), 2);

    let cache = open(dir.path(), origin.clone()).unwrap();
    assert_eq!(cache.freshness(&uri), Some(Freshness::Static));
    assert_eq!(cache.next_slot(), 2);
    let archive = cache.lookup(&uri).unwrap();
    assert!(archive.is_up_to_date());
    assert_eq!(archive.read_bytes().unwrap(), b"archive");
    // static copy is reused without asking the origin
    assert_eq!(origin.calls(), 2);
}

#[test]
fn test_second_instance_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::default());
    let first = open(dir.path(), origin.clone()).unwrap();

    match open(dir.path(), origin.clone()) {
        Err(LauncherError::CacheBusy(path)) => assert_eq!(path, dir.path()),
        other => panic!("expected CacheBusy, got {:?}", other.map(|_| ())),
    }

    drop(first);
    assert!(open(dir.path(), origin).is_ok());
}

#[test]
fn test_offline_origin_serves_stale_copy() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::default());
    origin.serve("http://games.example.org/b/", b"v1");
    let cache = open(dir.path(), origin.clone()).unwrap();
    let page = cache
        .get_resource(Url::parse("http://games.example.org/b/").unwrap(), false)
        .unwrap();

    let first = page.read().unwrap();
    assert!(!first.degraded);

    origin.go_offline("http://games.example.org/b/");
    let second = page.read().unwrap();
    assert!(second.degraded);
    assert_eq!(second.bytes, b"v1");
}

#[test]
fn test_flush_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::default());
    origin.serve("http://games.example.org/c/", b"page");
    origin.serve("http://games.example.org/c/game.zip", b"zip");

    let parent_uri = Url::parse("http://games.example.org/c/").unwrap();
    let child_uri = Url::parse("http://games.example.org/c/game.zip").unwrap();
    {
        let cache = open(dir.path(), origin.clone()).unwrap();
        let parent = cache.get_resource(parent_uri.clone(), true).unwrap();
        let child = parent.child(child_uri.clone(), true).unwrap();
        child.read().unwrap();
        parent.read().unwrap();
        parent.flush().unwrap();
    }

    let cache = open(dir.path(), origin.clone()).unwrap();
    assert_eq!(cache.children(&parent_uri), vec![child_uri.clone()]);
    assert!(cache.needs_reload(&child_uri));

    let before = origin.calls();
    cache.lookup(&child_uri).unwrap().read().unwrap();
    assert_eq!(origin.calls(), before + 1);
    assert!(!cache.needs_reload(&child_uri));
}

#[test]
fn test_redirects_are_populated_locally() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("mirror.zip");
    std::fs::write(&mirror, b"mirrored").unwrap();

    let settings = UrlMapSettings {
        properties: [(
            "mirror".to_string(),
            Url::from_file_path(&mirror).unwrap().to_string(),
        )]
        .into_iter()
        .collect(),
        redirects: vec![Redirect {
            source: "http://dead.example.org/game.zip".to_string(),
            target: "${mirror}".to_string(),
        }],
    };
    let origin = Arc::new(MemoryOrigin::default());
    let cache = Cache::open(
        CacheOptions::new(dir.path().join("cache"), origin.clone())
            .with_url_map(UrlMap::from_settings(&settings)),
    )
    .unwrap();

    let report = populate_redirects(&cache, Duration::from_millis(1));
    assert_eq!(report.fetched, vec!["http://dead.example.org/game.zip".to_string()]);
    assert!(report.failed.is_empty());

    let uri = cache.uri("http://dead.example.org/game.zip").unwrap();
    assert_eq!(uri.scheme(), "file");
    assert_eq!(
        cache.lookup(&uri).unwrap().read_bytes().unwrap(),
        b"mirrored"
    );
    assert_eq!(origin.calls(), 0);
}
