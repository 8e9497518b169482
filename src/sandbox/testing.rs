//! Scripted units and spawner for lifecycle tests
use crate::config::types::{LauncherError, Result};
use crate::sandbox::broker::RequestBroker;
use crate::sandbox::context::ExecutionContext;
use crate::sandbox::unit::{poll_until_dead, ExecutionUnit, SpawnRequest, UnitSpawner};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Behaviour {
    pub obeys_stop: bool,
    pub obeys_kill: bool,
}

impl Behaviour {
    pub const COOPERATIVE: Behaviour = Behaviour {
        obeys_stop: true,
        obeys_kill: true,
    };
    pub const IGNORES_STOP: Behaviour = Behaviour {
        obeys_stop: false,
        obeys_kill: true,
    };
    pub const UNKILLABLE: Behaviour = Behaviour {
        obeys_stop: false,
        obeys_kill: false,
    };
}

pub struct ScriptedUnit {
    id: String,
    alive: AtomicBool,
    behaviour: Behaviour,
    pub lines: Mutex<Vec<String>>,
}

impl ScriptedUnit {
    pub fn new(id: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            alive: AtomicBool::new(true),
            behaviour,
            lines: Mutex::new(Vec::new()),
        })
    }

    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl ExecutionUnit for ScriptedUnit {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn label(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn signal_stop(&self) -> Result<()> {
        if self.behaviour.obeys_stop {
            self.exit();
        }
        Ok(())
    }

    fn force_kill(&self) -> Result<()> {
        if self.behaviour.obeys_kill {
            self.exit();
        }
        Ok(())
    }

    fn join(&self, timeout: Duration) -> bool {
        poll_until_dead(self, timeout)
    }

    fn send_line(&self, line: &str) -> Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Spawns scripted units with a fixed behaviour
pub struct ScriptedSpawner {
    behaviour: Behaviour,
    fail: bool,
    count: AtomicUsize,
    pub spawned: Mutex<Vec<Arc<ScriptedUnit>>>,
}

impl ScriptedSpawner {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            fail: false,
            count: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            behaviour: Behaviour::COOPERATIVE,
            fail: true,
            count: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> Option<Arc<ScriptedUnit>> {
        self.spawned.lock().unwrap().last().cloned()
    }
}

impl UnitSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
        context: &Arc<ExecutionContext>,
        _broker: RequestBroker,
    ) -> Result<Arc<dyn ExecutionUnit>> {
        if self.fail {
            return Err(LauncherError::Process(format!(
                "cannot start {}",
                request.label
            )));
        }
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        let unit = ScriptedUnit::new(&format!("unit-{}", n), self.behaviour);
        context.register_unit(unit.clone());
        self.spawned.lock().unwrap().push(unit.clone());
        Ok(unit)
    }
}
