/// Execution units and the seams that create and discover them
use crate::config::types::Result;
use crate::sandbox::broker::RequestBroker;
use crate::sandbox::context::ExecutionContext;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One independently schedulable piece of a running game.
pub trait ExecutionUnit: Send + Sync {
    /// Stable identifier, unique within the game's context.
    fn id(&self) -> String;

    fn label(&self) -> &str;

    fn is_alive(&self) -> bool;

    /// Ask the unit to stop. The unit may ignore this.
    fn signal_stop(&self) -> Result<()>;

    /// Stop the unit unconditionally. Cannot be caught or ignored.
    fn force_kill(&self) -> Result<()>;

    /// Wait up to `timeout` for the unit to die. True when it is dead.
    fn join(&self, timeout: Duration) -> bool;

    /// Deliver one host->game control line.
    fn send_line(&self, line: &str) -> Result<()>;
}

/// Poll `is_alive` until it turns false or `timeout` elapses.
pub fn poll_until_dead(unit: &dyn ExecutionUnit, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !unit.is_alive() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

/// Everything needed to launch a game's main unit
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// Scheduling niceness added in the child.
    pub nice: i32,
}

/// Creates units inside a game's execution context.
pub trait UnitSpawner: Send + Sync {
    /// Launch the request as a new unit registered with `context`.
    /// Privileged requests the unit makes are answered by `broker`.
    fn spawn(
        &self,
        request: SpawnRequest,
        context: &Arc<ExecutionContext>,
        broker: RequestBroker,
    ) -> Result<Arc<dyn ExecutionUnit>>;
}

/// Finds units a game created on its own.
pub trait UnitDiscovery: Send + Sync {
    /// Live units not in `known` (by id).
    fn members(&self, known: &[String]) -> Vec<Arc<dyn ExecutionUnit>>;
}
