/// Lifecycle runner for one active game
///
/// State machine: NotStarted -> Starting -> Running -> Stopping ->
/// Destroyed, with ForcedDeath as the terminal state of a destroy that
/// could not confirm every unit dead. A destroyed runner is never reused.
use crate::config::settings::LifecycleTimings;
use crate::config::types::{GameFault, GameToken, LauncherError, Result, RunnerState};
use crate::game::configuration::{GameConfiguration, StyleVariant};
use crate::game::progress::Progress;
use crate::game::terminate::{terminate_context, KillReport};
use crate::kernel::process::lower_thread_priority;
use crate::observability::audit::events;
use crate::sandbox::unit::{ExecutionUnit, UnitSpawner};
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};

/// Control lines understood by applet-style games
pub mod lifecycle {
    pub const INIT: &str = "lifecycle:init";
    pub const START: &str = "lifecycle:start";
    pub const STOP: &str = "lifecycle:stop";
    pub const DESTROY: &str = "lifecycle:destroy";
}

/// Niceness of the setup thread.
const SETUP_NICE: i32 = 10;

/// Notifications a runner cannot deliver through a return value
pub trait RunnerEvents: Send + Sync {
    /// Setup failed after the starting caller stopped waiting.
    fn setup_failed(&self, token: GameToken, error: &LauncherError);
}

pub struct NoRunnerEvents;

impl RunnerEvents for NoRunnerEvents {
    fn setup_failed(&self, _token: GameToken, _error: &LauncherError) {}
}

struct Shared {
    config: Arc<GameConfiguration>,
    spawner: Arc<dyn UnitSpawner>,
    timings: LifecycleTimings,
    events: Arc<dyn RunnerEvents>,
    state: Mutex<RunnerState>,
    main: Mutex<Option<Arc<dyn ExecutionUnit>>>,
    last_report: Mutex<Option<KillReport>>,
}

pub struct LifecycleRunner {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LifecycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRunner")
            .field("game", &self.shared.config.name())
            .field("state", &self.state())
            .finish()
    }
}

impl LifecycleRunner {
    pub fn new(
        config: Arc<GameConfiguration>,
        spawner: Arc<dyn UnitSpawner>,
        timings: LifecycleTimings,
        events: Arc<dyn RunnerEvents>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                spawner,
                timings,
                events,
                state: Mutex::new(RunnerState::NotStarted),
                main: Mutex::new(None),
                last_report: Mutex::new(None),
            }),
        }
    }

    pub fn configuration(&self) -> &Arc<GameConfiguration> {
        &self.shared.config
    }

    pub fn token(&self) -> GameToken {
        self.shared.config.token()
    }

    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    /// Run the game's setup on a low-priority host thread.
    ///
    /// Waits up to the configured setup bound. An error raised while the
    /// caller still waits is returned and the game counts as never started.
    /// After the bound the caller gets `Ok` and later failures go to
    /// [`RunnerEvents::setup_failed`].
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if *state != RunnerState::NotStarted {
                return Err(LauncherError::InvalidState(format!(
                    "start from {:?}",
                    *state
                )));
            }
            *state = RunnerState::Starting;
        }

        let (tx, rx) = bounded::<Result<()>>(0);
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("gamebox-setup-{}", self.token().0))
            .spawn(move || {
                lower_thread_priority(SETUP_NICE);
                let result = shared.setup();
                if let Err(e) = &result {
                    shared.setup_failed(e);
                }
                if let Err(unsent) = tx.send(result) {
                    if let Err(e) = unsent.into_inner() {
                        if !e.is_forced_termination() {
                            shared.events.setup_failed(shared.config.token(), &e);
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            *self.shared.lock_state() = RunnerState::NotStarted;
            return Err(e.into());
        }

        match rx.recv_timeout(self.shared.timings.setup_wait()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: setup still running after {:?}, continuing",
                    self.token(),
                    self.shared.timings.setup_wait()
                );
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => Err(LauncherError::InvalidState(
                "setup thread ended without a result".to_string(),
            )),
        }
    }

    /// Tear the game down and terminate its whole execution context.
    ///
    /// Returns `Ok(true)` once no unit is left alive. `Ok(false)` means
    /// survivors remain and the runner is in ForcedDeath; calling destroy
    /// again re-runs the sweep.
    pub fn destroy(&self, progress: &Progress) -> Result<bool> {
        let from = {
            let mut state = self.shared.lock_state();
            let from = *state;
            match from {
                RunnerState::NotStarted => {
                    return Err(LauncherError::InvalidState(
                        "destroy before start".to_string(),
                    ))
                }
                RunnerState::Destroyed => return Ok(true),
                RunnerState::Stopping => {
                    return Err(LauncherError::InvalidState(
                        "destroy already in progress".to_string(),
                    ))
                }
                RunnerState::ForcedDeath => {}
                RunnerState::Starting | RunnerState::Running => *state = RunnerState::Stopping,
            }
            from
        };

        let config = &self.shared.config;
        info!("{}: destroying {} from {:?}", self.token(), config.name(), from);

        if from != RunnerState::ForcedDeath {
            self.shared.teardown(&progress.child(0.0, 0.2));
        }
        let report = terminate_context(config.context(), &self.shared.timings, &progress.child(0.2, 1.0));
        let confirmed = report.confirmed();
        *self
            .shared
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(report);

        let mut state = self.shared.lock_state();
        if confirmed {
            *state = RunnerState::Destroyed;
            events::game_stopped(config.context().correlation());
        } else {
            *state = RunnerState::ForcedDeath;
            error!("{}: {} is still running after destroy", self.token(), config.name());
        }
        Ok(confirmed)
    }

    /// Suspend an applet-style game. Standalone games only check state.
    pub fn pause(&self) -> Result<()> {
        self.lifecycle_event(lifecycle::STOP)
    }

    pub fn resume(&self) -> Result<()> {
        self.lifecycle_event(lifecycle::START)
    }

    /// Errors raised on the game's own units, forced terminations excluded.
    pub fn errors(&self) -> Vec<GameFault> {
        self.shared.config.context().faults()
    }

    pub fn has_live_units(&self) -> bool {
        self.shared.config.context().has_live_units()
    }

    pub fn last_kill_report(&self) -> Option<KillReport> {
        self.shared
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lifecycle_event(&self, line: &str) -> Result<()> {
        let state = self.state();
        if state != RunnerState::Running {
            return Err(LauncherError::InvalidState(format!(
                "{} while {:?}",
                line, state
            )));
        }
        if let StyleVariant::AppletStyle { .. } = self.shared.config.variant() {
            if let Some(main) = self.shared.main_unit() {
                main.send_line(line)?;
            }
        }
        Ok(())
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> RunnerState {
        *self.lock_state()
    }

    fn main_unit(&self) -> Option<Arc<dyn ExecutionUnit>> {
        self.main.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn setup(&self) -> Result<()> {
        let context = self.config.context();
        let request = self.config.launch_request()?;
        if context.is_terminating() {
            return Err(LauncherError::ForcedTermination);
        }

        let unit = self
            .spawner
            .spawn(request, context, self.config.broker())?;
        *self.main.lock().unwrap_or_else(|e| e.into_inner()) = Some(unit.clone());

        if context.is_terminating() {
            // destroy ran while we were spawning
            let _ = unit.force_kill();
            context.mark_force_killed(&unit.id());
            return Err(LauncherError::ForcedTermination);
        }

        if let StyleVariant::AppletStyle { .. } = self.config.variant() {
            unit.send_line(lifecycle::INIT)?;
            unit.send_line(lifecycle::START)?;
        }

        let mut state = self.lock_state();
        if *state == RunnerState::Starting {
            *state = RunnerState::Running;
            drop(state);
            events::game_started(context.correlation());
            info!("{}: {} running", self.config.token(), self.config.name());
        }
        Ok(())
    }

    /// Record the failure and reclaim anything the setup left behind.
    fn setup_failed(&self, error: &LauncherError) {
        if error.is_forced_termination() {
            return;
        }
        let context = self.config.context();
        context.record_error("setup", error);
        {
            let mut state = self.lock_state();
            if *state != RunnerState::Starting {
                return;
            }
            *state = RunnerState::Stopping;
        }
        error!("{}: setup of {} failed: {}", self.config.token(), self.config.name(), error);
        let report = terminate_context(context, &self.timings, &Progress::none());
        *self.lock_state() = if report.confirmed() {
            RunnerState::NotStarted
        } else {
            RunnerState::ForcedDeath
        };
    }

    /// Applet teardown hook, bounded by the teardown wait.
    fn teardown(&self, progress: &Progress) {
        let StyleVariant::AppletStyle { .. } = self.config.variant() else {
            return;
        };
        let Some(main) = self.main_unit() else {
            return;
        };
        progress.set(0.0, "stopping game");

        let (tx, rx) = bounded::<Result<()>>(1);
        let worker = main.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("gamebox-teardown-{}", self.config.token().0))
            .spawn(move || {
                let result = worker
                    .send_line(lifecycle::STOP)
                    .and_then(|_| worker.send_line(lifecycle::DESTROY));
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            warn!("{}: teardown worker not started: {}", self.config.token(), e);
            return;
        }

        match rx.recv_timeout(self.timings.teardown_wait()) {
            Ok(Ok(())) => {
                // give the game its cooperative window to exit on its own
                main.join(self.timings.cooperative_stop_wait());
            }
            Ok(Err(e)) => debug!("{}: teardown events not delivered: {}", self.config.token(), e),
            Err(_) => warn!(
                "{}: teardown did not finish within {:?}",
                self.config.token(),
                self.timings.teardown_wait()
            ),
        }
        progress.finish("game stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::model::SourceKind;
    use crate::game::testing::{quick_timings, Fixture};
    use crate::sandbox::testing::{Behaviour, ScriptedSpawner};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorded(StdMutex<Vec<GameToken>>);

    impl RunnerEvents for Recorded {
        fn setup_failed(&self, token: GameToken, _error: &LauncherError) {
            self.0.lock().unwrap().push(token);
        }
    }

    fn runner(fx: &Fixture, source: SourceKind, spawner: Arc<ScriptedSpawner>) -> LifecycleRunner {
        let config = fx.factory.build(&fx.detail("tetra", source)).unwrap();
        LifecycleRunner::new(config, spawner, quick_timings(), Arc::new(NoRunnerEvents))
    }

    #[test]
    fn test_applet_lifecycle_events() {
        let fx = Fixture::new();
        let spawner = ScriptedSpawner::new(Behaviour::COOPERATIVE);
        let runner = runner(&fx, SourceKind::MarkupHosted, spawner.clone());

        runner.start().unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        runner.pause().unwrap();
        runner.resume().unwrap();
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert_eq!(runner.state(), RunnerState::Destroyed);

        let lines = spawner.last().unwrap().lines.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                lifecycle::INIT,
                lifecycle::START,
                lifecycle::STOP,
                lifecycle::START,
                lifecycle::STOP,
                lifecycle::DESTROY
            ]
        );
    }

    #[test]
    fn test_standalone_gets_no_lifecycle_lines() {
        let fx = Fixture::new();
        let spawner = ScriptedSpawner::new(Behaviour::COOPERATIVE);
        let runner = runner(&fx, SourceKind::DescriptorHosted, spawner.clone());
        runner.start().unwrap();
        runner.pause().unwrap();
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert!(spawner.last().unwrap().lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_state_rules() {
        let fx = Fixture::new();
        let runner = runner(
            &fx,
            SourceKind::DescriptorHosted,
            ScriptedSpawner::new(Behaviour::COOPERATIVE),
        );
        assert!(matches!(
            runner.destroy(&Progress::none()),
            Err(LauncherError::InvalidState(_))
        ));
        assert!(runner.pause().is_err());
        runner.start().unwrap();
        assert!(matches!(runner.start(), Err(LauncherError::InvalidState(_))));
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert!(runner.start().is_err());
    }

    #[test]
    fn test_stubborn_game_destroyed_and_no_forced_errors() {
        let fx = Fixture::new();
        let runner = runner(
            &fx,
            SourceKind::DescriptorHosted,
            ScriptedSpawner::new(Behaviour::IGNORES_STOP),
        );
        runner.start().unwrap();
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert!(!runner.has_live_units());
        assert!(runner.errors().is_empty());
        assert_eq!(runner.last_kill_report().unwrap().force_killed.len(), 1);
    }

    #[test]
    fn test_unkillable_game_ends_in_forced_death() {
        let fx = Fixture::new();
        let spawner = ScriptedSpawner::new(Behaviour::UNKILLABLE);
        let runner = runner(&fx, SourceKind::DescriptorHosted, spawner.clone());
        runner.start().unwrap();
        assert!(!runner.destroy(&Progress::none()).unwrap());
        assert_eq!(runner.state(), RunnerState::ForcedDeath);

        // a later destroy re-runs the sweep
        spawner.last().unwrap().exit();
        assert!(runner.destroy(&Progress::none()).unwrap());
        assert_eq!(runner.state(), RunnerState::Destroyed);
    }

    #[test]
    fn test_setup_failure_is_returned_and_recorded() {
        let fx = Fixture::new();
        let config = fx
            .factory
            .build(&fx.detail("broken", SourceKind::DescriptorHosted))
            .unwrap();
        let events = Arc::new(Recorded::default());
        let runner = LifecycleRunner::new(
            config,
            ScriptedSpawner::failing(),
            quick_timings(),
            events.clone(),
        );
        assert!(matches!(runner.start(), Err(LauncherError::Process(_))));
        assert_eq!(runner.state(), RunnerState::NotStarted);
        assert_eq!(runner.errors().len(), 1);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_entry_fails_setup() {
        let fx = Fixture::new();
        let mut detail = fx.detail("noentry", SourceKind::DescriptorHosted);
        detail.entry = "missing.sh".to_string();
        let config = fx.factory.build(&detail).unwrap();
        let runner = LifecycleRunner::new(
            config,
            ScriptedSpawner::new(Behaviour::COOPERATIVE),
            quick_timings(),
            Arc::new(NoRunnerEvents),
        );
        assert!(matches!(runner.start(), Err(LauncherError::Loader(_))));
    }
}
