/// Games context and per-game execution contexts
///
/// The games context is the registry of every live per-game context, keyed
/// by [`GameToken`]. A per-game execution context owns the attribution
/// state for one game: its units, its process group, its recorded faults
/// and the marks left by a termination sweep.
use crate::config::types::{GameFault, GameToken, LauncherError, UnitExit};
use crate::observability::audit::CorrelationIds;
use crate::sandbox::unit::{ExecutionUnit, UnitDiscovery};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Network origin a game was loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn from_url(url: &url::Url) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Who is asking: a game token plus the unit that made the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub token: GameToken,
    pub unit: String,
}

impl Caller {
    pub fn new(token: GameToken, unit: impl Into<String>) -> Self {
        Self {
            token,
            unit: unit.into(),
        }
    }
}

pub struct ExecutionContext {
    token: GameToken,
    name: String,
    origin: Option<Origin>,
    units: Mutex<Vec<Arc<dyn ExecutionUnit>>>,
    discovery: RwLock<Option<Arc<dyn UnitDiscovery>>>,
    process_group: Mutex<Option<i32>>,
    faults: Mutex<Vec<GameFault>>,
    terminating: AtomicBool,
    force_killed: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("process_group", &self.process_group())
            .finish()
    }
}

impl ExecutionContext {
    fn new(token: GameToken, name: String, origin: Option<Origin>) -> Self {
        Self {
            token,
            name,
            origin,
            units: Mutex::new(Vec::new()),
            discovery: RwLock::new(None),
            process_group: Mutex::new(None),
            faults: Mutex::new(Vec::new()),
            terminating: AtomicBool::new(false),
            force_killed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn token(&self) -> GameToken {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn correlation(&self) -> CorrelationIds {
        let ids = CorrelationIds::for_game(self.token, &self.name);
        match self.process_group() {
            Some(pgid) => ids.with_pgid(pgid),
            None => ids,
        }
    }

    pub fn register_unit(&self, unit: Arc<dyn ExecutionUnit>) {
        debug!("{}: registered unit {}", self.token, unit.id());
        lock(&self.units).push(unit);
    }

    /// Attach the process group every unit of this game lives in.
    pub fn attach_process_group(&self, pgid: i32, discovery: Arc<dyn UnitDiscovery>) {
        *lock(&self.process_group) = Some(pgid);
        *self.discovery.write().unwrap_or_else(|e| e.into_inner()) = Some(discovery);
    }

    pub fn process_group(&self) -> Option<i32> {
        *lock(&self.process_group)
    }

    /// Registered units plus any discovered ones, alive at the time of the call.
    pub fn live_units(&self) -> Vec<Arc<dyn ExecutionUnit>> {
        let mut live: Vec<Arc<dyn ExecutionUnit>> = lock(&self.units)
            .iter()
            .filter(|u| u.is_alive())
            .cloned()
            .collect();

        let discovery = self
            .discovery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(discovery) = discovery {
            let known: Vec<String> = lock(&self.units).iter().map(|u| u.id()).collect();
            live.extend(discovery.members(&known).into_iter().filter(|u| u.is_alive()));
        }
        live
    }

    pub fn has_live_units(&self) -> bool {
        !self.live_units().is_empty()
    }

    pub fn begin_termination(&self) {
        if !self.terminating.swap(true, Ordering::SeqCst) {
            info!("{} ({}): termination started", self.token, self.name);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn mark_force_killed(&self, unit_id: &str) {
        lock(&self.force_killed).insert(unit_id.to_string());
    }

    pub fn was_force_killed(&self, unit_id: &str) -> bool {
        lock(&self.force_killed).contains(unit_id)
    }

    pub fn record_fault(&self, fault: GameFault) {
        info!("{} ({}): {}", self.token, self.name, fault);
        lock(&self.faults).push(fault);
    }

    /// Record an error raised on one of the game's units.
    /// The forced-death marker is dropped.
    pub fn record_error(&self, phase: &str, error: &LauncherError) {
        if error.is_forced_termination() {
            return;
        }
        self.record_fault(GameFault::Lifecycle {
            phase: phase.to_string(),
            message: error.to_string(),
        });
    }

    /// Called once when a unit has ended.
    ///
    /// Normal completion and deaths caused by a termination sweep are not
    /// faults.
    pub fn record_unit_exit(&self, unit_id: &str, exit: UnitExit, stderr_tail: &str) {
        if exit.is_success() {
            debug!("{}: unit {} completed", self.token, unit_id);
            return;
        }
        if self.is_terminating() || self.was_force_killed(unit_id) {
            debug!("{}: unit {} ended during termination ({})", self.token, unit_id, exit);
            return;
        }
        self.record_fault(GameFault::UnitFailed {
            unit: unit_id.to_string(),
            status: exit.to_string(),
            stderr_tail: stderr_tail.to_string(),
        });
    }

    pub fn faults(&self) -> Vec<GameFault> {
        lock(&self.faults).clone()
    }
}

/// Registry of live per-game contexts
#[derive(Debug, Default)]
pub struct GamesContext {
    next_token: AtomicU64,
    contexts: RwLock<BTreeMap<GameToken, Arc<ExecutionContext>>>,
}

impl GamesContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a token and register a fresh child context for it.
    pub fn create_context(&self, name: &str, origin: Option<Origin>) -> Arc<ExecutionContext> {
        let token = GameToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        let context = Arc::new(ExecutionContext::new(token, name.to_string(), origin));
        self.contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, context.clone());
        debug!("Registered context {} for {}", token, name);
        context
    }

    /// Look up the context owning `token`.
    ///
    /// The registry lock is only held to clone the handle, so a stop that
    /// is concurrently tearing the context down never blocks a check.
    pub fn attribute(&self, token: GameToken) -> Option<Arc<ExecutionContext>> {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&token)
            .cloned()
    }

    pub fn unregister(&self, token: GameToken) -> bool {
        let removed = self
            .contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token)
            .is_some();
        if removed {
            debug!("Unregistered context {}", token);
        }
        removed
    }

    pub fn tokens(&self) -> Vec<GameToken> {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_attributable() {
        let games = GamesContext::new();
        let a = games.create_context("a", None);
        let b = games.create_context("b", None);
        assert_ne!(a.token(), b.token());
        assert_eq!(games.attribute(a.token()).unwrap().name(), "a");
        assert!(games.unregister(a.token()));
        assert!(games.attribute(a.token()).is_none());
        assert!(!games.unregister(a.token()));
        assert_eq!(games.tokens(), vec![b.token()]);
    }

    #[test]
    fn test_origin_from_url() {
        let url = url::Url::parse("http://games.example.org/play/index.html").unwrap();
        assert_eq!(
            Origin::from_url(&url),
            Some(Origin {
                host: "games.example.org".to_string(),
                port: 80
            })
        );
        let file = url::Url::parse("file:///tmp/index.html").unwrap();
        assert_eq!(Origin::from_url(&file), None);
    }

    #[test]
    fn test_forced_termination_is_never_a_fault() {
        let games = GamesContext::new();
        let ctx = games.create_context("g", None);
        ctx.record_error("setup", &LauncherError::ForcedTermination);
        ctx.record_unit_exit("1", UnitExit::Exited(0), "");
        assert!(ctx.faults().is_empty());

        ctx.mark_force_killed("7");
        ctx.record_unit_exit("7", UnitExit::Signaled(9), "");
        assert!(ctx.faults().is_empty());

        ctx.record_unit_exit("8", UnitExit::Exited(3), "boom");
        assert_eq!(ctx.faults().len(), 1);

        ctx.begin_termination();
        ctx.record_unit_exit("9", UnitExit::Signaled(15), "");
        assert_eq!(ctx.faults().len(), 1);
    }
}
