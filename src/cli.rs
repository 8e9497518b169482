use crate::cache::fetch::HttpFetcher;
use crate::cache::populate::{populate_redirects, POPULATE_DELAY};
use crate::cache::{Cache, CacheOptions};
use crate::config::settings::LauncherConfig;
use crate::config::url_map::UrlMap;
use crate::game::model::{GameDescription, GameDetail, GameDetailRecord, GameSize, GameStyle, SourceKind};
use crate::game::orchestrator::{OrchestratorOptions, TransitionOutcome};
use crate::game::progress::{Progress, ProgressSink};
use crate::game::{ConfigurationFactory, GameOrchestrator};
use crate::kernel::process::ProcessSpawner;
use crate::kernel::signal::{ShutdownSignals, WaitOutcome};
use crate::sandbox::context::GamesContext;
use crate::sandbox::policy::PolicyGate;
use crate::sandbox::resolve::SystemResolver;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Launcher configuration file (defaults to ~/.gamebox/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Report teardown progress on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch one game and keep it running until it exits or a signal arrives
    Run {
        /// Launch record as JSON; the flags below fill in or override it
        #[arg(long)]
        detail: Option<PathBuf>,
        /// Game archive URI
        #[arg(long)]
        archive: Option<String>,
        /// Document base URI, the game's network origin
        #[arg(long)]
        document_base: Option<String>,
        /// Archive entry started as the main unit
        #[arg(long)]
        entry: Option<String>,
        /// applet or standalone
        #[arg(long)]
        style: Option<GameStyle>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        /// Launch parameter (format: key=value)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Download a URI into the cache
    Fetch {
        uri: String,
        /// Keep the copy until an explicit flush
        #[arg(long = "static")]
        is_static: bool,
    },
    /// Force the next read of a URI to download again
    Flush { uri: String },
    /// List cached entries
    List,
    /// Delete every cached entry
    Clear,
    /// Download every redirected URI
    Populate,
}

/// Teardown progress on stderr
struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, fraction: f64, message: &str) {
        eprintln!("[{:>3.0}%] {}", fraction * 100.0, message);
    }
}

fn parse_param(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("launch parameter {} is not key=value", raw))?;
    if key.is_empty() {
        return Err(anyhow!("launch parameter {} has an empty key", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn open_cache(config: &LauncherConfig) -> Result<Cache> {
    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let cache = Cache::open(
        CacheOptions::new(config.cache_dir.clone(), fetcher)
            .with_url_map(UrlMap::from_settings(&config.url_map)),
    )
    .with_context(|| format!("opening cache at {}", config.cache_dir.display()))?;
    Ok(cache)
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(LauncherConfig::default_path);
    let config = LauncherConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Err(e) = crate::observability::audit::init_security_logger(config.audit_log.clone()) {
        eprintln!("Failed to initialize security logger: {}", e);
        std::process::exit(1);
    }

    match cli.command {
        Commands::Run {
            detail,
            archive,
            document_base,
            entry,
            style,
            name,
            width,
            height,
            params,
        } => {
            let mut record = match detail {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<GameDetailRecord>(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => GameDetailRecord {
                    description: GameDescription::default(),
                    entry: String::new(),
                    archive: String::new(),
                    document_base: String::new(),
                    size: None,
                    parameters: BTreeMap::new(),
                },
            };
            if let Some(archive) = archive {
                record.archive = archive;
            }
            if let Some(document_base) = document_base {
                record.document_base = document_base;
            }
            if let Some(entry) = entry {
                record.entry = entry;
            }
            if let Some(name) = name {
                record.description.name = name;
            }
            if let Some(style) = style {
                record.description.source = match style {
                    GameStyle::Applet => SourceKind::MarkupHosted,
                    GameStyle::Standalone => SourceKind::DescriptorHosted,
                };
            }
            if width.is_some() || height.is_some() {
                let defaults = record.size.unwrap_or(GameSize {
                    width: config.applet.default_width,
                    height: config.applet.default_height,
                });
                record.size = Some(GameSize {
                    width: width.unwrap_or(defaults.width),
                    height: height.unwrap_or(defaults.height),
                });
            }
            for raw in &params {
                let (key, value) = parse_param(raw)?;
                record.parameters.insert(key, value);
            }
            if record.archive.is_empty() || record.document_base.is_empty() {
                return Err(anyhow!("run needs an archive and a document base"));
            }

            run_game(&config, record, cli.verbose)
        }
        Commands::Fetch { uri, is_static } => {
            let cache = open_cache(&config)?;
            let resource = cache.get_resource(cache.uri(&uri)?, is_static)?;
            let read = resource.read()?;
            if read.degraded {
                eprintln!("Warning: origin unreachable, served cached copy of {}", uri);
            }
            println!(
                "{} bytes -> {}",
                read.bytes.len(),
                resource
                    .local_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            Ok(())
        }
        Commands::Flush { uri } => {
            let cache = open_cache(&config)?;
            let url = cache.uri(&uri)?;
            match cache.lookup(&url) {
                Some(resource) => {
                    resource.flush()?;
                    println!("Flushed {}", url);
                }
                None => println!("{} is not cached", url),
            }
            Ok(())
        }
        Commands::List => {
            let cache = open_cache(&config)?;
            for entry in cache.entries() {
                println!(
                    "{:<8} {:<6} {} -> {}",
                    format!("{:?}", entry.freshness).to_lowercase(),
                    if entry.needs_reload { "stale" } else { "fresh" },
                    entry.uri,
                    entry.local.display()
                );
            }
            Ok(())
        }
        Commands::Clear => {
            let cache = open_cache(&config)?;
            let removed = cache.clear()?;
            println!("Removed {} cached entries", removed);
            Ok(())
        }
        Commands::Populate => {
            let cache = open_cache(&config)?;
            let report = populate_redirects(&cache, POPULATE_DELAY);
            println!("Fetched {} redirected URIs", report.fetched.len());
            for (uri, reason) in &report.failed {
                eprintln!("Failed {}: {}", uri, reason);
            }
            if report.failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("{} redirected URIs failed", report.failed.len()))
            }
        }
    }
}

fn run_game(config: &LauncherConfig, record: GameDetailRecord, verbose: bool) -> Result<()> {
    let signals = ShutdownSignals::install().map_err(|e| anyhow!(e))?;

    let cache = open_cache(config)?;
    let detail = GameDetail::resolve(record, &cache)?;

    let gate = Arc::new(PolicyGate::new(
        Arc::new(GamesContext::new()),
        config.security_mode,
        Arc::new(SystemResolver),
    ));
    let factory = Arc::new(ConfigurationFactory::new(gate, config));
    let mut options = OrchestratorOptions::default()
        .with_timings(config.lifecycle.clone())
        .with_watchdog_interval(config.watchdog_interval());
    if verbose {
        options = options.with_progress(Progress::new(Arc::new(StderrProgress)));
    }
    let orchestrator = GameOrchestrator::new(factory, Arc::new(ProcessSpawner::new()), options)?;

    let name = detail.name().to_string();
    let outcome = orchestrator
        .set_active_game(Some(detail))
        .recv()
        .map_err(|_| anyhow!("orchestrator stopped before {} started", name))?;
    match outcome {
        TransitionOutcome::Started { token, .. } => {
            eprintln!("{} started ({})", name, token);
        }
        TransitionOutcome::StartFailed { error, .. } => {
            orchestrator.shutdown();
            return Err(anyhow!("{} failed to start: {}", name, error));
        }
        other => {
            orchestrator.shutdown();
            return Err(anyhow!("unexpected outcome starting {}: {:?}", name, other));
        }
    }

    let waited = signals.wait_until(None, || match orchestrator.active_runner() {
        Some(runner) => !runner.has_live_units(),
        None => true,
    });
    if let WaitOutcome::Signaled(sig) = waited {
        eprintln!("Received signal {}, stopping {}", sig, name);
    }

    let faults = orchestrator
        .active_runner()
        .map(|runner| runner.errors())
        .unwrap_or_default();
    for fault in &faults {
        eprintln!("{}: {}", name, fault);
    }

    match orchestrator.shutdown() {
        TransitionOutcome::StillRunning { name, report } => {
            if let Some(report) = report {
                eprintln!("Survivors: {}", report.survivors.join(", "));
            }
            Err(anyhow!("{} is still running after destroy", name))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("level=3").unwrap(),
            ("level".to_string(), "3".to_string())
        );
        assert_eq!(
            parse_param("motd=a=b").unwrap(),
            ("motd".to_string(), "a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "gamebox",
            "run",
            "--archive",
            "http://games.example.org/a/game.zip",
            "--document-base",
            "http://games.example.org/a/",
            "--entry",
            "run.sh",
            "--style",
            "applet",
            "--param",
            "level=3",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { style, params, .. } => {
                assert_eq!(style, Some(GameStyle::Applet));
                assert_eq!(params, vec!["level=3".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }
}
