//! Real game processes driven through the runner and the orchestrator

mod common;

use common::{eventually, quick_timings, read_file, serial, Launcher};
use gamebox::config::types::{GameFault, RunnerState, SandboxDenied};
use gamebox::game::model::SourceKind;
use gamebox::game::orchestrator::{OrchestratorOptions, TransitionOutcome};
use gamebox::game::runner::NoRunnerEvents;
use gamebox::game::{GameOrchestrator, LifecycleRunner, Progress};
use gamebox::kernel::process::{process_group_members, ProcessSpawner};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOOP: &str = "while :; do sleep 0.05; done\n";

fn runner(launcher: &Launcher, detail: &gamebox::game::GameDetail) -> LifecycleRunner {
    let config = launcher.factory.build(detail).unwrap();
    LifecycleRunner::new(
        config,
        Arc::new(ProcessSpawner::new()),
        quick_timings(),
        Arc::new(NoRunnerEvents),
    )
}

#[test]
fn test_cooperative_game_stops_on_request() {
    let _serial = serial();
    let launcher = Launcher::new();
    let marker = launcher.path("bye");
    let mut detail = launcher.game(
        "polite",
        SourceKind::DescriptorHosted,
        &format!("trap 'echo bye > \"$GAMEBOX_PARAM_MARKER\"; exit 0' TERM\n{}", LOOP),
    );
    detail
        .parameters
        .insert("marker".to_string(), marker.display().to_string());

    let runner = runner(&launcher, &detail);
    runner.start().unwrap();
    assert_eq!(runner.state(), RunnerState::Running);
    assert!(runner.has_live_units());

    assert!(runner.destroy(&Progress::none()).unwrap());
    assert_eq!(runner.state(), RunnerState::Destroyed);
    assert_eq!(read_file(&marker).trim(), "bye");
    assert!(runner.last_kill_report().unwrap().force_killed.is_empty());
    assert!(runner.errors().is_empty());
}

#[test]
fn test_stubborn_group_is_killed() {
    let _serial = serial();
    let launcher = Launcher::new();
    // a background helper in the same group, ignoring SIGTERM like its parent
    let detail = launcher.game(
        "stubborn",
        SourceKind::DescriptorHosted,
        &format!("trap '' TERM\n( {} ) &\n{}", LOOP.trim(), LOOP),
    );
    let runner = runner(&launcher, &detail);
    runner.start().unwrap();
    let pgid = runner.configuration().context().process_group().unwrap();
    assert!(eventually(5, || process_group_members(pgid).len() >= 2));

    let started = Instant::now();
    assert!(runner.destroy(&Progress::none()).unwrap());
    let timings = quick_timings();
    assert!(started.elapsed() < timings.teardown_wait() + timings.termination_bound() + Duration::from_secs(2));

    let report = runner.last_kill_report().unwrap();
    assert!(!report.force_killed.is_empty());
    assert!(report.survivors.is_empty());
    assert!(eventually(2, || process_group_members(pgid).is_empty()));
    // killed units are not game errors
    assert!(runner.errors().is_empty());
}

#[test]
fn test_crashing_game_records_fault() {
    let _serial = serial();
    let launcher = Launcher::new();
    let detail = launcher.game(
        "crashy",
        SourceKind::DescriptorHosted,
        "echo 'out of cheese' >&2\nexit 3\n",
    );
    let runner = runner(&launcher, &detail);
    runner.start().unwrap();
    assert!(eventually(5, || !runner.has_live_units()));
    assert!(eventually(2, || !runner.errors().is_empty()));

    match &runner.errors()[0] {
        GameFault::UnitFailed { stderr_tail, .. } => assert!(stderr_tail.contains("out of cheese")),
        other => panic!("unexpected fault {:?}", other),
    }
    assert!(runner.destroy(&Progress::none()).unwrap());
}

#[test]
fn test_exit_request_is_denied() {
    let _serial = serial();
    let launcher = Launcher::new();
    let marker = launcher.path("reply");
    let mut detail = launcher.game(
        "quitter",
        SourceKind::DescriptorHosted,
        &format!(
            "echo 'host:exit 3'\nread reply\necho \"$reply\" > \"$GAMEBOX_PARAM_MARKER\"\n{}",
            LOOP
        ),
    );
    detail
        .parameters
        .insert("marker".to_string(), marker.display().to_string());

    let runner = runner(&launcher, &detail);
    runner.start().unwrap();
    assert!(eventually(5, || !read_file(&marker).is_empty()));
    assert!(read_file(&marker).starts_with("host:denied"));
    assert!(runner.has_live_units());
    assert!(runner
        .errors()
        .iter()
        .any(|f| matches!(f, GameFault::Denied { denial: SandboxDenied::Exit { status: 3 }, .. })));
    assert!(!launcher.gate.exit_permitted());

    assert!(runner.destroy(&Progress::none()).unwrap());
}

#[test]
fn test_connections_limited_to_origin() {
    let _serial = serial();
    let launcher = Launcher::new();
    let marker = launcher.path("replies");
    let mut detail = launcher.game(
        "netgame",
        SourceKind::DescriptorHosted,
        &format!(
            "for target in 'mirror.example.org 8080' 'games.example.org 22' 'evil.example.net 8080'; do\n\
             echo \"host:connect $target\"\n\
             read reply\n\
             echo \"$reply\" >> \"$GAMEBOX_PARAM_MARKER\"\n\
             done\n{}",
            LOOP
        ),
    );
    detail
        .parameters
        .insert("marker".to_string(), marker.display().to_string());

    let runner = runner(&launcher, &detail);
    runner.start().unwrap();
    assert!(eventually(5, || read_file(&marker).lines().count() == 3));
    let replies: Vec<String> = read_file(&marker).lines().map(str::to_string).collect();
    assert_eq!(replies[0], "host:ok");
    assert!(replies[1].starts_with("host:denied"));
    assert!(replies[2].starts_with("host:denied"));

    assert!(runner.destroy(&Progress::none()).unwrap());
}

#[test]
fn test_orchestrator_switches_real_games() {
    let _serial = serial();
    let launcher = Launcher::new();
    let orchestrator = GameOrchestrator::new(
        launcher.factory.clone(),
        Arc::new(ProcessSpawner::new()),
        OrchestratorOptions::default()
            .with_timings(quick_timings())
            .with_watchdog_interval(Duration::from_millis(50)),
    )
    .unwrap();

    let first = launcher.game("first", SourceKind::DescriptorHosted, LOOP);
    let second = launcher.game("second", SourceKind::MarkupHosted, LOOP);

    let outcome = orchestrator
        .set_active_game(Some(first))
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert!(matches!(outcome, TransitionOutcome::Started { .. }));
    let first_pgid = orchestrator
        .active_runner()
        .unwrap()
        .configuration()
        .context()
        .process_group()
        .unwrap();

    let outcome = orchestrator
        .set_active_game(Some(second))
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert!(matches!(outcome, TransitionOutcome::Started { ref name, .. } if name == "second"));
    assert!(process_group_members(first_pgid).is_empty());

    assert!(matches!(orchestrator.shutdown(), TransitionOutcome::Stopped { .. }));
    assert!(launcher.gate.exit_permitted());
    assert!(eventually(2, || launcher.gate.games().is_empty()));
}
