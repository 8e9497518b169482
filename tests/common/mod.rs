//! Shared helpers for integration tests
#![allow(dead_code)]

use gamebox::cache::fetch::Fetcher;
use gamebox::cache::{Cache, CacheOptions};
use gamebox::config::settings::{LauncherConfig, LifecycleTimings};
use gamebox::config::types::{FetchError, SecurityMode};
use gamebox::game::model::{GameDescription, GameDetail, GameDetailRecord, SourceKind};
use gamebox::game::ConfigurationFactory;
use gamebox::sandbox::context::GamesContext;
use gamebox::sandbox::policy::PolicyGate;
use gamebox::sandbox::resolve::StaticResolver;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// In-memory origin server
#[derive(Default)]
pub struct MemoryOrigin {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: AtomicUsize,
}

impl MemoryOrigin {
    pub fn serve(&self, url: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    pub fn go_offline(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for MemoryOrigin {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bodies = self.bodies.lock().unwrap();
        let body = bodies.get(url.as_str()).ok_or_else(|| FetchError::Unreachable {
            uri: url.to_string(),
            reason: "connection refused".to_string(),
        })?;
        sink.write_all(body)?;
        Ok(body.len() as u64)
    }
}

pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn quick_timings() -> LifecycleTimings {
    LifecycleTimings {
        setup_wait_ms: 5_000,
        teardown_wait_ms: 500,
        cooperative_stop_wait_ms: 300,
        forced_kill_wait_ms: 100,
        forced_kill_rounds: 5,
        max_units_per_sweep: 100,
    }
}

/// Launcher services rooted in a temp directory
pub struct Launcher {
    pub dir: tempfile::TempDir,
    pub cache: Cache,
    pub gate: Arc<PolicyGate>,
    pub factory: Arc<ConfigurationFactory>,
}

impl Launcher {
    pub fn new() -> Self {
        // scratch executables must live on an exec-capable filesystem
        let dir = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
        let cache = Cache::open(
            CacheOptions::new(dir.path().join("cache"), Arc::new(MemoryOrigin::default()))
                .without_lock(),
        )
        .unwrap();
        let resolver = StaticResolver::new()
            .with_host("games.example.org", &["192.0.2.10".parse().unwrap()])
            .with_host("mirror.example.org", &["192.0.2.10".parse().unwrap()]);
        let gate = Arc::new(PolicyGate::new(
            Arc::new(GamesContext::new()),
            SecurityMode::Public,
            Arc::new(resolver),
        ));
        let factory = Arc::new(ConfigurationFactory::new(
            gate.clone(),
            &LauncherConfig::default(),
        ));
        Self {
            dir,
            cache,
            gate,
            factory,
        }
    }

    /// A game whose `run.sh` entry is the given shell script body.
    pub fn game(&self, name: &str, source: SourceKind, script: &str) -> GameDetail {
        let archive = self.dir.path().join(format!("{}.zip", name));
        let body = format!("#!/bin/sh\n{}", script);
        std::fs::write(&archive, zip_bytes(&[("run.sh", &body)])).unwrap();
        GameDetail::resolve(
            GameDetailRecord {
                description: GameDescription {
                    name: name.to_string(),
                    source,
                    ..Default::default()
                },
                entry: "run.sh".to_string(),
                archive: Url::from_file_path(&archive).unwrap().to_string(),
                document_base: format!("http://games.example.org:8080/{}/", name),
                size: None,
                parameters: BTreeMap::new(),
            },
            &self.cache,
        )
        .unwrap()
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

/// Held by tests that spawn real processes, so no concurrent fork keeps a
/// freshly written entry point open for writing.
pub static SPAWN_SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> std::sync::MutexGuard<'static, ()> {
    SPAWN_SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `cond` until it holds or `secs` elapse.
pub fn eventually(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(secs);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    cond()
}

pub fn read_file(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
