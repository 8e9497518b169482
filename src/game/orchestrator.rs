/// Single-active-game orchestrator and its watchdog
///
/// `set_active_game` is the only way games start and stop. Transitions run
/// on a dedicated worker thread, one at a time, under one coarse lock:
/// stop the old game, then start the new one. A game that cannot be
/// confirmed dead aborts the transition and stays active.
use crate::config::settings::LifecycleTimings;
use crate::config::types::{GameToken, LauncherError, Result, RunnerState};
use crate::game::configuration::{ConfigurationFactory, GameConfiguration};
use crate::game::model::GameDetail;
use crate::game::progress::Progress;
use crate::game::runner::{LifecycleRunner, RunnerEvents};
use crate::game::terminate::KillReport;
use crate::kernel::process::lower_thread_priority;
use crate::observability::audit::events;
use crate::sandbox::policy::PolicyGate;
use crate::sandbox::unit::UnitSpawner;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const WATCHDOG_NICE: i32 = 10;

/// Result of one `set_active_game` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Started { token: GameToken, name: String },
    /// The previous game stopped and nothing replaced it.
    Stopped { token: GameToken, name: String },
    /// Nothing was running and nothing was requested.
    Idle,
    /// The previous game could not be confirmed dead; nothing changed.
    StillRunning { name: String, report: Option<KillReport> },
    StartFailed { name: String, error: String },
}

pub trait GameStateListener: Send + Sync {
    fn on_game_started(&self, detail: &GameDetail, token: GameToken);
    fn on_game_stopped(&self, detail: &GameDetail, token: GameToken);
}

/// User-facing error reporting
pub trait ErrorSink: Send + Sync {
    fn report(&self, game: &str, error: &LauncherError);
}

pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, game: &str, error: &LauncherError) {
        error!("{}: {}", game, error);
    }
}

/// Disposes top-level windows a game left behind.
pub trait WindowSweeper: Send + Sync {
    /// Returns how many windows were disposed.
    fn dispose_foreign_windows(&self, token: GameToken) -> usize;
}

pub struct NoWindows;

impl WindowSweeper for NoWindows {
    fn dispose_foreign_windows(&self, _token: GameToken) -> usize {
        0
    }
}

struct ActiveGame {
    detail: GameDetail,
    runner: Arc<LifecycleRunner>,
}

/// State the watchdog reads without touching the transition lock
#[derive(Default)]
struct WatchState {
    /// Start requested but no runner materialized yet.
    pending_start: Option<(String, Instant)>,
    /// Stopped games kept until their context is confirmed empty.
    retired: Vec<Arc<GameConfiguration>>,
}

enum Command {
    Activate {
        detail: Option<GameDetail>,
        reply: Sender<TransitionOutcome>,
    },
    StopGame(GameToken),
}

struct Shared {
    factory: Arc<ConfigurationFactory>,
    spawner: Arc<dyn UnitSpawner>,
    timings: LifecycleTimings,
    active: Mutex<Option<ActiveGame>>,
    watch: Mutex<WatchState>,
    listeners: RwLock<Vec<Arc<dyn GameStateListener>>>,
    errors: Arc<dyn ErrorSink>,
    windows: Arc<dyn WindowSweeper>,
    progress: Progress,
    commands: Sender<Command>,
    running: AtomicBool,
}

/// Builder-style options for [`GameOrchestrator::new`]
pub struct OrchestratorOptions {
    pub timings: LifecycleTimings,
    pub watchdog_interval: Duration,
    pub errors: Arc<dyn ErrorSink>,
    pub windows: Arc<dyn WindowSweeper>,
    pub progress: Progress,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            timings: LifecycleTimings::default(),
            watchdog_interval: Duration::from_millis(100),
            errors: Arc::new(LogErrorSink),
            windows: Arc::new(NoWindows),
            progress: Progress::none(),
        }
    }
}

impl OrchestratorOptions {
    pub fn with_timings(mut self, timings: LifecycleTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_window_sweeper(mut self, windows: Arc<dyn WindowSweeper>) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

pub struct GameOrchestrator {
    shared: Arc<Shared>,
    gate: Arc<PolicyGate>,
    worker: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    watchdog_stop: Mutex<Option<Sender<()>>>,
}

/// Forwards runner notifications to the worker queue.
struct StopOnSetupFailure {
    commands: Sender<Command>,
}

impl RunnerEvents for StopOnSetupFailure {
    fn setup_failed(&self, token: GameToken, error: &LauncherError) {
        warn!("{}: late setup failure: {}", token, error);
        let _ = self.commands.send(Command::StopGame(token));
    }
}

impl GameOrchestrator {
    pub fn new(
        factory: Arc<ConfigurationFactory>,
        spawner: Arc<dyn UnitSpawner>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let (commands, queue) = unbounded();
        let gate = factory.gate().clone();
        let shared = Arc::new(Shared {
            factory,
            spawner,
            timings: options.timings,
            active: Mutex::new(None),
            watch: Mutex::new(WatchState::default()),
            listeners: RwLock::new(Vec::new()),
            errors: options.errors,
            windows: options.windows,
            progress: options.progress,
            commands: commands.clone(),
            running: AtomicBool::new(true),
        });

        let violations = commands;
        gate.set_violation_handler(Box::new(move |token| {
            let _ = violations.send(Command::StopGame(token));
        }));

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("gamebox-orchestrator".to_string())
            .spawn(move || worker_shared.work(queue))?;

        let watch_shared = shared.clone();
        let interval = options.watchdog_interval;
        let (watchdog_stop, stop_requested) = bounded::<()>(0);
        let watchdog = std::thread::Builder::new()
            .name("gamebox-watchdog".to_string())
            .spawn(move || {
                lower_thread_priority(WATCHDOG_NICE);
                while watch_shared.running.load(Ordering::SeqCst) {
                    watch_shared.watchdog_tick();
                    if !matches!(
                        stop_requested.recv_timeout(interval),
                        Err(RecvTimeoutError::Timeout)
                    ) {
                        break;
                    }
                }
            })?;

        Ok(Self {
            shared,
            gate,
            worker: Mutex::new(Some(worker)),
            watchdog: Mutex::new(Some(watchdog)),
            watchdog_stop: Mutex::new(Some(watchdog_stop)),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn GameStateListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Request a transition to `detail` (or to no game).
    pub fn set_active_game(&self, detail: Option<GameDetail>) -> Receiver<TransitionOutcome> {
        let (reply, outcome) = bounded(1);
        if !self.shared.running.load(Ordering::SeqCst) {
            let _ = reply.send(TransitionOutcome::StartFailed {
                name: detail.map(|d| d.name().to_string()).unwrap_or_default(),
                error: "launcher is shutting down".to_string(),
            });
            return outcome;
        }
        if let Err(e) = self.shared.commands.send(Command::Activate { detail, reply }) {
            warn!("Orchestrator queue closed: {}", e);
        }
        outcome
    }

    pub fn active_token(&self) -> Option<GameToken> {
        self.shared.lock_active().as_ref().map(|a| a.runner.token())
    }

    pub fn active_runner(&self) -> Option<Arc<LifecycleRunner>> {
        self.shared.lock_active().as_ref().map(|a| a.runner.clone())
    }

    /// Number of stopped games whose contexts still await confirmation.
    pub fn retired_count(&self) -> usize {
        self.shared.lock_watch().retired.len()
    }

    /// Stop the active game, stop the background threads, then open the
    /// exit gate. The only path by which the launcher may exit cleanly.
    pub fn shutdown(&self) -> TransitionOutcome {
        let outcome = if self.shared.running.load(Ordering::SeqCst) {
            self.set_active_game(None)
                .recv()
                .unwrap_or(TransitionOutcome::Idle)
        } else {
            TransitionOutcome::Idle
        };
        self.shared.running.store(false, Ordering::SeqCst);

        self.watchdog_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = self.watchdog.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        // one last sweep of anything retired
        self.shared.watchdog_tick();

        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }

        self.gate.open_exit_gate();
        info!("Orchestrator shut down");
        outcome
    }
}

impl Drop for GameOrchestrator {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

impl Shared {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveGame>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_watch(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.watch.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn work(self: Arc<Self>, queue: Receiver<Command>) {
        loop {
            match queue.recv_timeout(Duration::from_millis(50)) {
                Ok(Command::Activate { detail, reply }) => {
                    let outcome = self.transition(detail);
                    let _ = reply.send(outcome);
                }
                Ok(Command::StopGame(token)) => self.stop_if_active(token),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.running.load(Ordering::SeqCst) && queue.is_empty() {
                break;
            }
        }
        debug!("Orchestrator worker finished");
    }

    fn transition(&self, detail: Option<GameDetail>) -> TransitionOutcome {
        let mut active = self.lock_active();

        let mut stopped = None;
        if let Some(current) = active.as_ref() {
            match self.stop(current) {
                Ok(()) => {
                    stopped = active.take();
                }
                Err(outcome) => return outcome,
            }
        }

        let Some(detail) = detail else {
            return match stopped {
                Some(old) => TransitionOutcome::Stopped {
                    token: old.runner.token(),
                    name: old.detail.name().to_string(),
                },
                None => TransitionOutcome::Idle,
            };
        };

        let name = detail.name().to_string();
        self.lock_watch().pending_start = Some((name.clone(), Instant::now()));
        let started = self.start(&detail);
        self.lock_watch().pending_start = None;

        match started {
            Ok(runner) => {
                let token = runner.token();
                *active = Some(ActiveGame {
                    detail: detail.clone(),
                    runner,
                });
                drop(active);
                for listener in self.listeners() {
                    listener.on_game_started(&detail, token);
                }
                TransitionOutcome::Started { token, name }
            }
            Err(error) => {
                self.errors.report(&name, &error);
                TransitionOutcome::StartFailed {
                    name,
                    error: error.to_string(),
                }
            }
        }
    }

    /// Stop half. On failure the game stays active.
    fn stop(&self, current: &ActiveGame) -> std::result::Result<(), TransitionOutcome> {
        let name = current.detail.name().to_string();
        let token = current.runner.token();
        let destroyed = match current.runner.state() {
            RunnerState::NotStarted => Ok(true),
            _ => current.runner.destroy(&self.progress),
        };

        match destroyed {
            Ok(true) => {
                info!("{} ({}) stopped", name, token);
                self.lock_watch()
                    .retired
                    .push(current.runner.configuration().clone());
                for listener in self.listeners() {
                    listener.on_game_stopped(&current.detail, token);
                }
                Ok(())
            }
            Ok(false) => {
                let error = LauncherError::StillRunningAfterDestroy { name: name.clone() };
                self.errors.report(&name, &error);
                Err(TransitionOutcome::StillRunning {
                    name,
                    report: current.runner.last_kill_report(),
                })
            }
            Err(e) => {
                self.errors.report(&name, &e);
                Err(TransitionOutcome::StillRunning { name, report: None })
            }
        }
    }

    fn start(&self, detail: &GameDetail) -> Result<Arc<LifecycleRunner>> {
        let config = self.factory.build(detail)?;
        let runner = Arc::new(LifecycleRunner::new(
            config,
            self.spawner.clone(),
            self.timings.clone(),
            Arc::new(StopOnSetupFailure {
                commands: self.commands.clone(),
            }),
        ));
        if let Err(e) = runner.start() {
            if runner.has_live_units() {
                self.lock_watch()
                    .retired
                    .push(runner.configuration().clone());
            }
            return Err(e);
        }
        Ok(runner)
    }

    fn stop_if_active(&self, token: GameToken) {
        let mut active = self.lock_active();
        let is_target = matches!(active.as_ref(), Some(a) if a.runner.token() == token);
        if !is_target {
            return;
        }
        info!("Stopping {} after a policy violation or setup failure", token);
        if let Some(current) = active.as_ref() {
            if self.stop(current).is_ok() {
                active.take();
            }
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn GameStateListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One watchdog pass. Never takes the transition lock.
    fn watchdog_tick(&self) {
        let mut watch = self.lock_watch();

        let limit = self.timings.setup_wait() + Duration::from_secs(1);
        let overdue = matches!(&watch.pending_start, Some((_, since)) if since.elapsed() > limit);
        if overdue {
            if let Some((name, since)) = watch.pending_start.take() {
                warn!("{} was requested {:?} ago but never started", name, since.elapsed());
                self.errors.report(
                    &name,
                    &LauncherError::InvalidState("game never started".to_string()),
                );
            }
        }

        let retired = std::mem::take(&mut watch.retired);
        drop(watch);

        let mut keep = Vec::new();
        for config in retired {
            let context = config.context();
            let live = context.live_units();
            if live.is_empty() {
                debug!("{}: confirmed empty, releasing", config.token());
                continue;
            }
            for unit in &live {
                context.mark_force_killed(&unit.id());
                if let Err(e) = unit.force_kill() {
                    debug!("{}: watchdog kill of {} failed: {}", config.token(), unit.id(), e);
                }
            }
            let windows = self.windows.dispose_foreign_windows(config.token());
            config.loader().release();
            events::watchdog_sweep(context.correlation(), live.len());
            warn!(
                "{}: watchdog killed {} unit(s), disposed {} window(s)",
                config.token(),
                live.len(),
                windows
            );
            keep.push(config);
        }
        // the next tick confirms
        self.lock_watch().retired.extend(keep);
    }
}
