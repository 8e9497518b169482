/// Launcher configuration loading from config.json
use crate::config::types::{LauncherError, Result, SecurityMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full config.json structure. Every field falls back to its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub cache_dir: PathBuf,
    /// Audit trail location; `None` picks a per-user default.
    pub audit_log: Option<PathBuf>,
    pub security_mode: SecurityMode,
    /// Leading name segment reserved for the launcher itself.
    pub host_namespace: String,
    /// Directory consulted before a game's own archive.
    pub trusted_runtime_dir: Option<PathBuf>,
    pub lifecycle: LifecycleTimings,
    pub archive: ArchiveLimits,
    pub watchdog_interval_ms: u64,
    pub fetch: FetchSettings,
    pub url_map: UrlMapSettings,
    pub applet: AppletSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleTimings {
    /// Upper bound a caller of `start(wait = true)` blocks for setup.
    pub setup_wait_ms: u64,
    /// Bound on the game's own teardown hook.
    pub teardown_wait_ms: u64,
    /// Phase 1 per-unit wait after a cooperative stop signal.
    pub cooperative_stop_wait_ms: u64,
    /// Phase 2 per-unit wait after a forced kill.
    pub forced_kill_wait_ms: u64,
    pub forced_kill_rounds: u32,
    /// Cap on units enumerated by one sweep.
    pub max_units_per_sweep: usize,
}

/// Bounds on what decoding one game archive may allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveLimits {
    pub max_entry_bytes: u64,
    /// Sum of all decoded entries.
    pub max_archive_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
}

/// One configured URI redirection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlMapSettings {
    /// Values substituted for `${key}` placeholders.
    pub properties: BTreeMap<String, String>,
    pub redirects: Vec<Redirect>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppletSettings {
    pub default_width: u32,
    pub default_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            setup_wait_ms: 1_000_000,
            teardown_wait_ms: 3_000,
            cooperative_stop_wait_ms: 500,
            forced_kill_wait_ms: 100,
            forced_kill_rounds: 10,
            max_units_per_sweep: 2_000,
        }
    }
}

impl LifecycleTimings {
    pub fn setup_wait(&self) -> Duration {
        Duration::from_millis(self.setup_wait_ms)
    }

    pub fn teardown_wait(&self) -> Duration {
        Duration::from_millis(self.teardown_wait_ms)
    }

    pub fn cooperative_stop_wait(&self) -> Duration {
        Duration::from_millis(self.cooperative_stop_wait_ms)
    }

    pub fn forced_kill_wait(&self) -> Duration {
        Duration::from_millis(self.forced_kill_wait_ms)
    }

    /// Worst-case time a termination sweep spends waiting per unit.
    pub fn termination_bound(&self) -> Duration {
        self.cooperative_stop_wait()
            + self.forced_kill_wait() * self.forced_kill_rounds
    }
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 256 * 1024 * 1024,
            max_archive_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: format!("gamebox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for AppletSettings {
    fn default() -> Self {
        Self {
            default_width: 800,
            default_height: 600,
            max_width: 1000,
            max_height: 1000,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let home = Self::home_dir();
        Self {
            cache_dir: home.join("downloads"),
            audit_log: None,
            security_mode: SecurityMode::default(),
            host_namespace: "gamebox".to_string(),
            trusted_runtime_dir: None,
            lifecycle: LifecycleTimings::default(),
            archive: ArchiveLimits::default(),
            watchdog_interval_ms: 100,
            fetch: FetchSettings::default(),
            url_map: UrlMapSettings::default(),
            applet: AppletSettings::default(),
        }
    }
}

impl LauncherConfig {
    /// Launcher home: `$GAMEBOX_HOME`, else `~/.gamebox`.
    pub fn home_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("GAMEBOX_HOME") {
            return PathBuf::from(home);
        }
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(".gamebox")
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.json")
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LauncherError::Config(format!("Failed to read config file: {}", e)))?;
        let config: LauncherConfig = serde_json::from_str(&content)
            .map_err(|e| LauncherError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_namespace.trim().is_empty() {
            return Err(LauncherError::Config(
                "host_namespace must not be empty".to_string(),
            ));
        }
        if self.host_namespace.contains(['.', '/']) {
            return Err(LauncherError::Config(format!(
                "host_namespace must be a single segment, got {}",
                self.host_namespace
            )));
        }

        let timings = &self.lifecycle;
        if timings.forced_kill_rounds == 0 {
            return Err(LauncherError::Config(
                "lifecycle.forced_kill_rounds must be at least 1".to_string(),
            ));
        }
        if timings.cooperative_stop_wait_ms == 0 || timings.forced_kill_wait_ms == 0 {
            return Err(LauncherError::Config(
                "lifecycle waits must be positive".to_string(),
            ));
        }
        if timings.max_units_per_sweep == 0 {
            return Err(LauncherError::Config(
                "lifecycle.max_units_per_sweep must be positive".to_string(),
            ));
        }
        if self.archive.max_entry_bytes == 0 || self.archive.max_archive_bytes == 0 {
            return Err(LauncherError::Config(
                "archive limits must be positive".to_string(),
            ));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(LauncherError::Config(
                "watchdog_interval_ms must be positive".to_string(),
            ));
        }

        let applet = &self.applet;
        if applet.default_width > applet.max_width || applet.default_height > applet.max_height {
            return Err(LauncherError::Config(format!(
                "default applet size {}x{} exceeds maximum {}x{}",
                applet.default_width, applet.default_height, applet.max_width, applet.max_height
            )));
        }

        Ok(())
    }
}
