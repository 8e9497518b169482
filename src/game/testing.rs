//! Launcher services over a temp directory, for lifecycle tests
use crate::cache::fetch::HttpFetcher;
use crate::cache::{Cache, CacheOptions};
use crate::config::settings::{FetchSettings, LauncherConfig, LifecycleTimings};
use crate::config::types::SecurityMode;
use crate::game::configuration::ConfigurationFactory;
use crate::game::model::{GameDescription, GameDetail, GameDetailRecord, SourceKind};
use crate::loader::archive::test_archives::zip_bytes;
use crate::sandbox::context::GamesContext;
use crate::sandbox::policy::PolicyGate;
use crate::sandbox::resolve::StaticResolver;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub cache: Cache,
    pub gate: Arc<PolicyGate>,
    pub factory: Arc<ConfigurationFactory>,
}

pub fn quick_timings() -> LifecycleTimings {
    LifecycleTimings {
        setup_wait_ms: 2_000,
        teardown_wait_ms: 200,
        cooperative_stop_wait_ms: 50,
        forced_kill_wait_ms: 10,
        forced_kill_rounds: 3,
        max_units_per_sweep: 100,
    }
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(
            CacheOptions::new(
                dir.path().join("cache"),
                Arc::new(HttpFetcher::new(&FetchSettings::default()).unwrap()),
            )
            .without_lock(),
        )
        .unwrap();
        let gate = Arc::new(PolicyGate::new(
            Arc::new(GamesContext::new()),
            SecurityMode::Public,
            Arc::new(StaticResolver::new()),
        ));
        let factory = Arc::new(ConfigurationFactory::new(gate.clone(), &LauncherConfig::default()));
        Self {
            dir,
            cache,
            gate,
            factory,
        }
    }

    /// A game whose archive holds a single `run.sh` entry.
    pub fn detail(&self, name: &str, source: SourceKind) -> GameDetail {
        let archive = self.dir.path().join(format!("{}.zip", name));
        std::fs::write(&archive, zip_bytes(&[("run.sh", "#!/bin/sh\n")])).unwrap();
        GameDetail::resolve(
            GameDetailRecord {
                description: GameDescription {
                    name: name.to_string(),
                    source,
                    ..Default::default()
                },
                entry: "run.sh".to_string(),
                archive: Url::from_file_path(&archive).unwrap().to_string(),
                document_base: format!("http://games.example.org/{}/", name),
                size: None,
                parameters: BTreeMap::new(),
            },
            &self.cache,
        )
        .unwrap()
    }
}
