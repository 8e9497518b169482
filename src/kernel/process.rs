/// Game processes and process-group discovery
///
/// Each game's main process is started as the leader of a new process
/// group, which is the game's execution context at the OS level. Anything
/// the game forks stays in that group and is found again by scanning
/// `/proc`.
use crate::config::types::{LauncherError, Result, UnitExit};
use crate::sandbox::broker::RequestBroker;
use crate::sandbox::context::ExecutionContext;
use crate::sandbox::unit::{ExecutionUnit, SpawnRequest, UnitDiscovery, UnitSpawner};
use crate::utils::output::{OutputTail, DEFAULT_TAIL_LIMIT};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Scheduling state and process group of one process, from /proc/<pid>/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
}

impl ProcStat {
    /// Zombies and dead tasks count as gone.
    pub fn is_dead(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse the contents of a /proc/<pid>/stat file.
pub fn parse_stat(pid: i32, contents: &str) -> Option<ProcStat> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &contents[contents.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { pid, state, pgrp })
}

pub fn proc_stat(pid: i32) -> Option<ProcStat> {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(pid, &contents)
}

/// Every non-dead process whose process group is `pgid`.
pub fn process_group_members(pgid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut members: Vec<i32> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<i32>().ok()))
        .filter_map(proc_stat)
        .filter(|stat| stat.pgrp == pgid && !stat.is_dead())
        .map(|stat| stat.pid)
        .collect();
    members.sort_unstable();
    members
}

/// Send `sig` to the whole group. A group with no members is not an error.
pub fn signal_group(pgid: i32, sig: Signal) -> Result<()> {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LauncherError::Process(format!(
            "killpg({}, {}) failed: {}",
            pgid, sig, e
        ))),
    }
}

fn signal_pid(pid: i32, sig: Signal) -> Result<()> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LauncherError::Process(format!(
            "kill({}, {}) failed: {}",
            pid, sig, e
        ))),
    }
}

/// Raise the calling thread's nice value by `increment`. Failure is
/// logged and reported as `false`.
pub fn lower_thread_priority(increment: i32) -> bool {
    // SAFETY: errno is thread-local, and on Linux nice(2) applies only to
    // the calling thread.
    let failed = unsafe {
        *libc::__errno_location() = 0;
        libc::nice(increment) == -1 && *libc::__errno_location() != 0
    };
    if failed {
        warn!(
            "Could not lower priority of thread {} by {}: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            increment,
            std::io::Error::last_os_error()
        );
    }
    !failed
}

/// Exit slot shared by a unit and its monitor thread
#[derive(Default)]
struct ExitSlot {
    exit: Mutex<Option<UnitExit>>,
    changed: Condvar,
}

impl ExitSlot {
    fn set(&self, exit: UnitExit) {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(exit);
        self.changed.notify_all();
    }

    fn get(&self) -> Option<UnitExit> {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

fn write_line(stdin: &SharedStdin, line: &str) -> Result<()> {
    let mut guard = stdin.lock().unwrap_or_else(|e| e.into_inner());
    let pipe = guard
        .as_mut()
        .ok_or_else(|| LauncherError::Process("control channel closed".to_string()))?;
    let outcome = pipe
        .write_all(line.as_bytes())
        .and_then(|_| pipe.write_all(b"\n"))
        .and_then(|_| pipe.flush());
    if let Err(e) = outcome {
        *guard = None;
        return Err(LauncherError::Process(format!("control channel: {}", e)));
    }
    Ok(())
}

/// A child process started by the launcher
pub struct ProcessUnit {
    pid: i32,
    label: String,
    stdin: SharedStdin,
    exit: Arc<ExitSlot>,
    stderr: OutputTail,
}

impl ProcessUnit {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<UnitExit> {
        self.exit.get()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr.snapshot()
    }
}

impl ExecutionUnit for ProcessUnit {
    fn id(&self) -> String {
        self.pid.to_string()
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_alive(&self) -> bool {
        self.exit.get().is_none()
    }

    fn signal_stop(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        signal_pid(self.pid, Signal::SIGTERM)
    }

    fn force_kill(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        signal_pid(self.pid, Signal::SIGKILL)
    }

    fn join(&self, timeout: Duration) -> bool {
        self.exit.wait(timeout)
    }

    fn send_line(&self, line: &str) -> Result<()> {
        write_line(&self.stdin, line)
    }
}

/// A process the game forked itself, found through its process group
pub struct GroupMember {
    pid: i32,
    pgid: i32,
    label: String,
}

impl GroupMember {
    pub fn new(pid: i32, pgid: i32) -> Self {
        Self {
            pid,
            pgid,
            label: format!("pid {}", pid),
        }
    }
}

impl ExecutionUnit for GroupMember {
    fn id(&self) -> String {
        self.pid.to_string()
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_alive(&self) -> bool {
        // a recycled pid outside the group is not ours any more
        matches!(proc_stat(self.pid), Some(stat) if stat.pgrp == self.pgid && !stat.is_dead())
    }

    fn signal_stop(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        signal_pid(self.pid, Signal::SIGTERM)
    }

    fn force_kill(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        signal_pid(self.pid, Signal::SIGKILL)
    }

    fn join(&self, timeout: Duration) -> bool {
        crate::sandbox::unit::poll_until_dead(self, timeout)
    }

    fn send_line(&self, _line: &str) -> Result<()> {
        Err(LauncherError::Process(format!(
            "{} has no control channel",
            self.label
        )))
    }
}

/// /proc scan of one game's process group
pub struct GroupScan {
    pgid: i32,
}

impl GroupScan {
    pub fn new(pgid: i32) -> Self {
        Self { pgid }
    }
}

impl UnitDiscovery for GroupScan {
    fn members(&self, known: &[String]) -> Vec<Arc<dyn ExecutionUnit>> {
        process_group_members(self.pgid)
            .into_iter()
            .filter(|pid| !known.contains(&pid.to_string()))
            .map(|pid| Arc::new(GroupMember::new(pid, self.pgid)) as Arc<dyn ExecutionUnit>)
            .collect()
    }
}

/// Spawns game units as process-group leaders
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    tail_limit: usize,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self {
            tail_limit: DEFAULT_TAIL_LIMIT,
        }
    }
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(request: &SpawnRequest) -> Command {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .env_clear()
            .envs(&request.env)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let nice = request.nice;
        if nice != 0 {
            // SAFETY: nice(2) is async-signal-safe and touches no Rust state.
            unsafe {
                cmd.pre_exec(move || {
                    *libc::__errno_location() = 0;
                    let rc = libc::nice(nice);
                    if rc == -1 && *libc::__errno_location() != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

impl UnitSpawner for ProcessSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
        context: &Arc<ExecutionContext>,
        broker: RequestBroker,
    ) -> Result<Arc<dyn ExecutionUnit>> {
        let mut child = Self::build_command(&request).spawn().map_err(|e| {
            LauncherError::Process(format!(
                "failed to start {}: {}",
                request.program.display(),
                e
            ))
        })?;
        let pid = child.id() as i32;
        debug!("{}: started {} as pid {}", context.token(), request.label, pid);

        let stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));
        let stderr = OutputTail::new(self.tail_limit);
        let exit = Arc::new(ExitSlot::default());
        let unit = Arc::new(ProcessUnit {
            pid,
            label: request.label.clone(),
            stdin: stdin.clone(),
            exit: exit.clone(),
            stderr: stderr.clone(),
        });

        context.attach_process_group(pid, Arc::new(GroupScan::new(pid)));
        context.register_unit(unit.clone());

        let unit_id = pid.to_string();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let sink = OutputTail::new(self.tail_limit);
            let label = request.label.clone();
            let reply_to = stdin.clone();
            let id = unit_id.clone();
            readers.push(sink.collect(format!("gamebox-out-{}", pid), stdout, move |line| {
                match broker.handle_line(&id, line) {
                    Some(reply) => {
                        if let Err(e) = write_line(&reply_to, &reply) {
                            debug!("{}: reply not delivered: {}", label, e);
                        }
                    }
                    None => debug!("[{}] {}", label, line),
                }
            })?);
        }
        if let Some(err) = child.stderr.take() {
            readers.push(stderr.collect(format!("gamebox-err-{}", pid), err, |_| {})?);
        }

        let ctx = context.clone();
        let label = request.label;
        std::thread::Builder::new()
            .name(format!("gamebox-wait-{}", pid))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("{}: wait on {} failed: {}", ctx.token(), label, e);
                        exit.set(UnitExit::Signaled(0));
                        return;
                    }
                };
                let result = match (status.code(), status.signal()) {
                    (Some(code), _) => UnitExit::Exited(code),
                    (None, Some(sig)) => UnitExit::Signaled(sig),
                    (None, None) => UnitExit::Signaled(0),
                };
                // the pid is reaped: publish before anything can signal it again
                exit.set(result);
                debug!("{}: {} ended ({})", ctx.token(), label, result);
                for reader in readers {
                    let _ = reader.join();
                }
                ctx.record_unit_exit(&unit_id, result, &stderr.snapshot());
            })?;

        Ok(unit)
    }
}
