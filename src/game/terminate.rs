/// Two-phase termination of a game's execution context
///
/// Phase 1 asks every live unit to stop and waits once for all of them.
/// Phase 2 force-kills survivors for a fixed number of short rounds. Units
/// are only counted as gone once they are confirmed dead.
use crate::config::settings::LifecycleTimings;
use crate::game::progress::Progress;
use crate::kernel::process::signal_group;
use crate::observability::audit::events;
use crate::sandbox::context::ExecutionContext;
use crate::sandbox::unit::ExecutionUnit;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// What a termination sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    /// Units sent a cooperative stop.
    pub asked_to_stop: usize,
    /// Ids of units that needed a forced kill.
    pub force_killed: Vec<String>,
    /// Ids still alive when the sweep gave up.
    pub survivors: Vec<String>,
    pub rounds: u32,
    pub elapsed_ms: u64,
    pub notes: Vec<String>,
}

impl KillReport {
    /// True when no unit of the context is left alive.
    pub fn confirmed(&self) -> bool {
        self.survivors.is_empty()
    }
}

fn capped(mut units: Vec<Arc<dyn ExecutionUnit>>, cap: usize, report: &mut KillReport) -> Vec<Arc<dyn ExecutionUnit>> {
    if units.len() > cap {
        report
            .notes
            .push(format!("{} units found, sweeping first {}", units.len(), cap));
        units.truncate(cap);
    }
    units
}

/// Wait until every unit is dead or `deadline` passes. Returns survivors.
fn wait_all(units: &[Arc<dyn ExecutionUnit>], deadline: Instant) -> Vec<Arc<dyn ExecutionUnit>> {
    units
        .iter()
        .filter(|unit| {
            let left = deadline.saturating_duration_since(Instant::now());
            !unit.join(left)
        })
        .cloned()
        .collect()
}

/// Stop every unit of `context`, escalating to forced kills.
pub fn terminate_context(
    context: &ExecutionContext,
    timings: &LifecycleTimings,
    progress: &Progress,
) -> KillReport {
    let start = Instant::now();
    let mut report = KillReport::default();
    context.begin_termination();

    let units = capped(context.live_units(), timings.max_units_per_sweep, &mut report);
    if units.is_empty() {
        debug!("{}: nothing to terminate", context.token());
        progress.finish("no units running");
        return report;
    }

    // phase 1
    progress.set(0.0, "asking game to stop");
    for unit in &units {
        if let Err(e) = unit.signal_stop() {
            report.notes.push(format!("stop {}: {}", unit.id(), e));
        }
        report.asked_to_stop += 1;
    }
    events::graceful_stop(context.correlation(), report.asked_to_stop);
    let mut survivors = wait_all(&units, Instant::now() + timings.cooperative_stop_wait());

    // phase 2
    let rounds = timings.forced_kill_rounds.max(1);
    while report.rounds < rounds {
        // re-enumerate: a stopping game may have forked
        let forked: Vec<_> = context
            .live_units()
            .into_iter()
            .filter(|u| !survivors.iter().any(|s| s.id() == u.id()))
            .collect();
        survivors.extend(forked);
        survivors = capped(survivors, timings.max_units_per_sweep, &mut report);
        if survivors.is_empty() {
            break;
        }

        report.rounds += 1;
        progress.set(
            0.2 + 0.8 * f64::from(report.rounds) / f64::from(rounds),
            "forcing game to stop",
        );
        for unit in &survivors {
            let id = unit.id();
            context.mark_force_killed(&id);
            if let Err(e) = unit.force_kill() {
                report.notes.push(format!("kill {}: {}", id, e));
            }
            if !report.force_killed.contains(&id) {
                report.force_killed.push(id);
            }
        }
        if let Some(pgid) = context.process_group() {
            if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                report.notes.push(e.to_string());
            }
        }
        survivors = wait_all(&survivors, Instant::now() + timings.forced_kill_wait());
    }

    if !report.force_killed.is_empty() {
        events::forced_kill(context.correlation(), &report.force_killed);
    }

    report.survivors = context
        .live_units()
        .iter()
        .map(|u| u.id())
        .collect();
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    if report.confirmed() {
        info!(
            "{}: {} unit(s) stopped, {} forced, in {} ms",
            context.token(),
            report.asked_to_stop,
            report.force_killed.len(),
            report.elapsed_ms
        );
    } else {
        warn!(
            "{}: units survived termination: {}",
            context.token(),
            report.survivors.join(", ")
        );
        events::still_running(context.correlation(), &report.survivors);
    }
    progress.finish("game stopped");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::context::GamesContext;
    use crate::sandbox::testing::{Behaviour, ScriptedUnit};
    use std::time::Duration;

    fn timings() -> LifecycleTimings {
        LifecycleTimings {
            cooperative_stop_wait_ms: 50,
            forced_kill_wait_ms: 10,
            forced_kill_rounds: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_cooperative_units_need_no_kill() {
        let games = GamesContext::new();
        let ctx = games.create_context("g", None);
        ctx.register_unit(ScriptedUnit::new("1", Behaviour::COOPERATIVE));
        let report = terminate_context(&ctx, &timings(), &Progress::none());
        assert!(report.confirmed());
        assert_eq!(report.asked_to_stop, 1);
        assert!(report.force_killed.is_empty());
        assert_eq!(report.rounds, 0);
    }

    #[test]
    fn test_stubborn_unit_is_force_killed_within_bound() {
        let games = GamesContext::new();
        let ctx = games.create_context("g", None);
        ctx.register_unit(ScriptedUnit::new("1", Behaviour::IGNORES_STOP));
        ctx.register_unit(ScriptedUnit::new("2", Behaviour::COOPERATIVE));
        let started = Instant::now();
        let report = terminate_context(&ctx, &timings(), &Progress::none());
        assert!(report.confirmed());
        assert_eq!(report.force_killed, vec!["1".to_string()]);
        assert!(ctx.was_force_killed("1"));
        assert!(!ctx.has_live_units());
        assert!(started.elapsed() < timings().termination_bound() + Duration::from_millis(500));
    }

    #[test]
    fn test_unkillable_unit_reported_as_survivor() {
        let games = GamesContext::new();
        let ctx = games.create_context("g", None);
        ctx.register_unit(ScriptedUnit::new("ghost", Behaviour::UNKILLABLE));
        let report = terminate_context(&ctx, &timings(), &Progress::none());
        assert!(!report.confirmed());
        assert_eq!(report.survivors, vec!["ghost".to_string()]);
        assert_eq!(report.rounds, 3);
        assert!(ctx.faults().is_empty());
    }
}
