/// Core types and error taxonomy for the gamebox launcher
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Explicit identity of one launched game.
///
/// Every call a game makes into shared host services (network, cache,
/// exit) carries its token, so attribution never depends on inspecting
/// the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameToken(pub u64);

impl fmt::Display for GameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "game-{}", self.0)
    }
}

/// How strictly the policy gate treats outbound connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Connections restricted to the game's origin.
    #[default]
    Public,
    /// Same restrictions as public, with verbose decision logging.
    Developer,
    /// Connection restrictions disabled; exit rules still apply.
    Debug,
}

/// Freshness class of a cached resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freshness {
    /// Downloaded once, refetched only after an explicit flush.
    #[serde(rename = "static")]
    Static,
    /// Refetched on every read; a stale local copy is only a fallback.
    #[serde(rename = "volatile")]
    Volatile,
    /// A `file:` resource read in place and never copied into the cache.
    #[serde(rename = "local-static")]
    LocalStatic,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Static => "static",
            Freshness::Volatile => "volatile",
            Freshness::LocalStatic => "local-static",
        }
    }
}

/// Privileged operation rejected by the policy gate or the loader
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxDenied {
    #[error("exit with status {status} denied")]
    Exit { status: i32 },

    #[error("connection to {host}:{port} denied")]
    Connect { host: String, port: u16 },

    #[error("name {name} lies in the host namespace")]
    HostNamespace { name: String },

    #[error("trusted lookup refused path {name}")]
    TrustedPath { name: String },

    #[error("request from unknown game {token}")]
    UnknownGame { token: GameToken },
}

/// Neither container format could be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("archive {archive} is unreadable (container: {primary}; compressed stream: {fallback})")]
pub struct ArchiveFormatError {
    pub archive: String,
    pub primary: String,
    pub fallback: String,
}

/// Failures talking to a remote origin
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{uri} is unreachable: {reason}")]
    Unreachable { uri: String, reason: String },

    #[error("{uri} answered with HTTP status {status}")]
    Status { uri: String, status: u16 },

    #[error("unsupported scheme for {0}")]
    UnsupportedScheme(String),

    #[error("IO error while fetching: {0}")]
    Io(#[from] std::io::Error),
}

/// Launcher error taxonomy
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// No network and no local fallback.
    #[error("Resource {uri} is unavailable: {reason}")]
    CacheUnavailable { uri: String, reason: String },

    /// A stale fallback copy was served. Informational only.
    #[error("Stale copy of {uri} served")]
    CacheDegraded { uri: String },

    #[error(transparent)]
    ArchiveFormat(#[from] ArchiveFormatError),

    #[error("Sandbox denied: {0}")]
    SandboxDenied(#[from] SandboxDenied),

    /// Marker for a unit the launcher killed. Never a diagnostic.
    #[error("Execution unit forcibly terminated")]
    ForcedTermination,

    #[error("Game {name} is still running after destroy")]
    StillRunningAfterDestroy { name: String },

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Cache read of {0} attempted on the presentation thread")]
    PresentationThreadRead(String),

    #[error("Cache index version {found} is incompatible with {expected}")]
    IncompatibleCacheIndex { found: String, expected: String },

    #[error("Cache directory {0} is in use by another launcher")]
    CacheBusy(PathBuf),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LauncherError {
    /// True for the marker that must never surface as a game error.
    pub fn is_forced_termination(&self) -> bool {
        matches!(self, LauncherError::ForcedTermination)
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Error captured on a game's execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameFault {
    /// A privileged request was rejected.
    Denied { unit: String, denial: SandboxDenied },
    /// A unit exited abnormally on its own.
    UnitFailed {
        unit: String,
        status: String,
        stderr_tail: String,
    },
    /// Setup or teardown raised an error.
    Lifecycle { phase: String, message: String },
}

impl fmt::Display for GameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameFault::Denied { unit, denial } => write!(f, "{}: {}", unit, denial),
            GameFault::UnitFailed {
                unit,
                status,
                stderr_tail,
            } => {
                if stderr_tail.is_empty() {
                    write!(f, "{} failed ({})", unit, status)
                } else {
                    write!(f, "{} failed ({}): {}", unit, status, stderr_tail)
                }
            }
            GameFault::Lifecycle { phase, message } => write!(f, "{} failed: {}", phase, message),
        }
    }
}

/// How an execution unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    Exited(i32),
    Signaled(i32),
}

impl UnitExit {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitExit::Exited(0))
    }
}

impl fmt::Display for UnitExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitExit::Exited(code) => write!(f, "exit status {}", code),
            UnitExit::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

/// Lifecycle runner states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Destroyed,
    /// Terminal: a destroy left units that could not be confirmed dead.
    ForcedDeath,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Destroyed | RunnerState::ForcedDeath)
    }
}
