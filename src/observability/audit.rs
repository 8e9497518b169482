/// Structured audit trail of policy decisions and game lifecycle transitions.
///
/// Events are written as JSON lines and mirrored to `log` by severity.
/// Correlation ids tie every event to the launcher run and, when known, the game.
use crate::config::types::{GameToken, LauncherError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Policy gate
    ExitDenied,
    ExitAllowed,
    ConnectAllowed,
    ConnectDenied,
    HostNamespaceRefused,

    // Lifecycle
    GameStarted,
    GameStopped,
    GracefulStop,
    ForcedKill,
    StillRunningAfterDestroy,
    WatchdogSweep,

    // Cache
    CacheDegraded,
    CacheCleared,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ExitDenied => SecuritySeverity::High,
            SecurityEventType::ExitAllowed => SecuritySeverity::Low,
            SecurityEventType::ConnectAllowed => SecuritySeverity::Low,
            SecurityEventType::ConnectDenied => SecuritySeverity::Medium,
            SecurityEventType::HostNamespaceRefused => SecuritySeverity::High,

            SecurityEventType::GameStarted => SecuritySeverity::Low,
            SecurityEventType::GameStopped => SecuritySeverity::Low,
            SecurityEventType::GracefulStop => SecuritySeverity::Low,
            SecurityEventType::ForcedKill => SecuritySeverity::Medium,
            SecurityEventType::StillRunningAfterDestroy => SecuritySeverity::Critical,
            SecurityEventType::WatchdogSweep => SecuritySeverity::High,

            SecurityEventType::CacheDegraded => SecuritySeverity::Medium,
            SecurityEventType::CacheCleared => SecuritySeverity::Low,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Launcher process run
    pub run_id: String,
    pub game_token: Option<GameToken>,
    pub game_name: Option<String>,
    /// Process group of the game's execution context
    pub pgid: Option<i32>,
}

static RUN_ID: OnceLock<String> = OnceLock::new();

/// Identifier shared by every event this process emits.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| Uuid::new_v4().to_string())
}

impl CorrelationIds {
    pub fn for_game(token: GameToken, name: &str) -> Self {
        Self {
            run_id: run_id().to_string(),
            game_token: Some(token),
            game_name: Some(name.to_string()),
            pgid: None,
        }
    }

    pub fn with_pgid(mut self, pgid: i32) -> Self {
        self.pgid = Some(pgid);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub host: Option<String>,
    pub uri: Option<String>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details,
            correlation: None,
            host: None,
            uri: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_uri(mut self, uri: String) -> Self {
        self.uri = Some(uri);
        self
    }
}

/// Writes the audit trail and mirrors events to the standard logger
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("gamebox")
                .join("security-audit.log")
        });

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LauncherError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| LauncherError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_security_event(&self, event: SecurityEvent) {
        let mut entry = serde_json::json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "event_type": event.event_type,
            "severity": event.severity,
            "details": event.details,
            "process_id": std::process::id(),
        });
        if let Some(correlation) = &event.correlation {
            entry["correlation"] =
                serde_json::to_value(correlation).unwrap_or(serde_json::Value::Null);
        }
        if let Some(host) = &event.host {
            entry["host"] = serde_json::json!(host);
        }
        if let Some(uri) = &event.uri {
            entry["uri"] = serde_json::json!(uri);
        }

        log_to_standard(&event);

        let mut file = self.audit_file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", entry) {
            error!("Failed to write to audit log: {}", e);
        }
        if let Err(e) = file.flush() {
            error!("Failed to flush audit log: {}", e);
        }
    }

    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

fn log_to_standard(event: &SecurityEvent) {
    let label = match &event.correlation {
        Some(CorrelationIds {
            game_name: Some(name),
            ..
        }) => format!("{:?} [{}]", event.event_type, name),
        _ => format!("{:?}", event.event_type),
    };
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!("SECURITY: {} - {}", label, event.details)
        }
        SecuritySeverity::Medium => warn!("SECURITY: {} - {}", label, event.details),
        SecuritySeverity::Low => info!("SECURITY: {} - {}", label, event.details),
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global audit trail.
///
/// Without an explicit path, per-user fallbacks are tried; if every path
/// fails, events keep flowing to the standard logger only.
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    match SecurityLogger::new(audit_path.clone()) {
        Ok(logger) => {
            if SECURITY_LOGGER.set(logger).is_err() {
                warn!("Security logger already initialized");
            } else {
                info!("Security logger initialized");
            }
            Ok(())
        }
        Err(e) if audit_path.is_none() => {
            let fallback_paths = [
                std::env::temp_dir().join(format!(
                    "gamebox-security-audit-{}.log",
                    nix::unistd::geteuid()
                )),
                crate::config::settings::LauncherConfig::home_dir().join("security-audit.log"),
            ];
            for fallback in fallback_paths {
                match SecurityLogger::new(Some(fallback.clone())) {
                    Ok(logger) => {
                        if SECURITY_LOGGER.set(logger).is_ok() {
                            warn!(
                                "Security logger initialized using fallback path: {}",
                                fallback.display()
                            );
                        }
                        return Ok(());
                    }
                    Err(fallback_err) => warn!(
                        "Failed to initialize fallback security logger at {}: {}",
                        fallback.display(),
                        fallback_err
                    ),
                }
            }
            warn!("Audit file unavailable, security events go to the log only: {}", e);
            Ok(())
        }
        Err(e) => {
            error!("Failed to initialize security logger: {}", e);
            Err(e)
        }
    }
}

pub fn log_security_event(event: SecurityEvent) {
    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.log_security_event(event);
    } else {
        log_to_standard(&event);
    }
}

/// Convenience constructors for the events the launcher emits
pub mod events {
    use super::*;

    pub fn exit_denied(correlation: CorrelationIds, status: i32) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ExitDenied,
                format!("Exit with status {} denied; stopping game", status),
            )
            .with_correlation(correlation),
        );
    }

    pub fn exit_allowed(reason: &str) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::ExitAllowed,
            format!("Exit allowed: {}", reason),
        ));
    }

    pub fn connect_decision(correlation: Option<CorrelationIds>, host: &str, port: u16, allowed: bool) {
        let (event_type, verb) = if allowed {
            (SecurityEventType::ConnectAllowed, "allowed")
        } else {
            (SecurityEventType::ConnectDenied, "denied")
        };
        let mut event = SecurityEvent::new(
            event_type,
            format!("Connection to {}:{} {}", host, port, verb),
        )
        .with_host(host.to_string());
        if let Some(correlation) = correlation {
            event = event.with_correlation(correlation);
        }
        log_security_event(event);
    }

    pub fn host_namespace_refused(archive: &str, name: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::HostNamespaceRefused,
                format!("Refused to resolve host name {}", name),
            )
            .with_uri(archive.to_string()),
        );
    }

    pub fn game_started(correlation: CorrelationIds) {
        log_security_event(
            SecurityEvent::new(SecurityEventType::GameStarted, "Game started".to_string())
                .with_correlation(correlation),
        );
    }

    pub fn game_stopped(correlation: CorrelationIds) {
        log_security_event(
            SecurityEvent::new(SecurityEventType::GameStopped, "Game stopped".to_string())
                .with_correlation(correlation),
        );
    }

    pub fn graceful_stop(correlation: CorrelationIds, units: usize) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::GracefulStop,
                format!("Cooperative stop sent to {} unit(s)", units),
            )
            .with_correlation(correlation),
        );
    }

    pub fn forced_kill(correlation: CorrelationIds, killed: &[String]) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ForcedKill,
                format!("Forced kill of {}", killed.join(", ")),
            )
            .with_correlation(correlation),
        );
    }

    pub fn still_running(correlation: CorrelationIds, survivors: &[String]) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::StillRunningAfterDestroy,
                format!("Units survived destroy: {}", survivors.join(", ")),
            )
            .with_correlation(correlation),
        );
    }

    pub fn watchdog_sweep(correlation: CorrelationIds, units: usize) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::WatchdogSweep,
                format!("Watchdog reclaimed {} orphaned unit(s)", units),
            )
            .with_correlation(correlation),
        );
    }

    pub fn cache_degraded(uri: &str, host: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::CacheDegraded,
                format!("Origin {} unreachable, serving stale copy", host),
            )
            .with_host(host.to_string())
            .with_uri(uri.to_string()),
        );
    }

    pub fn cache_cleared(removed: usize) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::CacheCleared,
            format!("Cache cleared ({} files removed)", removed),
        ));
    }
}
