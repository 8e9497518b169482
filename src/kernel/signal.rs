use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Launcher shutdown signals
///
/// SIGINT, SIGTERM and SIGHUP only flip atomics; the main loop notices and
/// runs the orderly shutdown path, which is the one place allowed to end
/// the process while games may be running.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why [`ShutdownSignals::wait_until`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled(i32),
    ConditionMet,
    TimedOut,
}

pub struct ShutdownSignals;

impl ShutdownSignals {
    /// Install the handlers. Call before spawning worker threads.
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(Self::on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only stores into atomics.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }

        info!("Shutdown handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    extern "C" fn on_signal(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal number received, if any.
    pub fn received(&self) -> Option<i32> {
        match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Block until a shutdown signal arrives, `done` returns true, or
    /// `timeout` (if any) elapses.
    pub fn wait_until(&self, timeout: Option<Duration>, mut done: impl FnMut() -> bool) -> WaitOutcome {
        let start = Instant::now();
        loop {
            if self.shutdown_requested() {
                return WaitOutcome::Signaled(self.received().unwrap_or(0));
            }
            if done() {
                return WaitOutcome::ConditionMet;
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return WaitOutcome::TimedOut;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[cfg(test)]
    fn reset(&self) {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}
