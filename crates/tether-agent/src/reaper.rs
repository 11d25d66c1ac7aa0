//! Child reaper
//!
//! Child-subreaper status and SIGCHLD are process-wide, so there is one
//! reaper per process. Every child the agent starts is spawned through
//! [`Reaper::track`], which holds the pid table lock across the spawn: the
//! reaper cannot collect a pid before its owner is recorded. Anything
//! reaped without an owner is an adopted orphan and is discarded.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::oneshot;

use crate::signals;

/// Sweep interval in case a SIGCHLD was coalesced away
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

static REAPER: OnceLock<Reaper> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide reaper of child processes
pub struct Reaper {
    pids: Mutex<HashMap<i32, oneshot::Sender<u32>>>,
    orphans: AtomicU64,
}

impl Reaper {
    /// The process reaper, started on first use
    pub fn global() -> &'static Reaper {
        REAPER.get_or_init(|| {
            let reaper = Reaper {
                pids: Mutex::new(HashMap::new()),
                orphans: AtomicU64::new(0),
            };
            become_subreaper();
            if let Err(e) = std::thread::Builder::new()
                .name("tether-reaper".into())
                .spawn(run)
            {
                tracing::error!("Failed to start child reaper: {}", e);
            }
            reaper
        })
    }

    /// Spawn a child and register for its exit status
    ///
    /// `spawn` runs under the pid table lock and returns the child's pid
    /// together with whatever else the caller needs from the spawn.
    pub fn track<T, E, F>(&self, spawn: F) -> Result<(T, oneshot::Receiver<u32>), E>
    where
        F: FnOnce() -> Result<(i32, T), E>,
    {
        let mut pids = lock(&self.pids);
        let (pid, value) = spawn()?;
        let (tx, rx) = oneshot::channel();
        pids.insert(pid, tx);
        Ok((value, rx))
    }

    /// Orphans reaped so far
    pub fn orphans(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    /// Collect every child with a pending status change
    fn reap(&self) {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let mut pids = lock(&self.pids);

        loop {
            let (pid, code) = match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, code as u32),
                Ok(WaitStatus::Signaled(pid, signal, _)) => (pid, signals::exit_code(signal)),
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(other) => {
                    tracing::trace!("Non-exit status change: {:?}", other);
                    continue;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!("waitpid failed: {}", e);
                    break;
                }
            };

            match pids.remove(&pid.as_raw()) {
                Some(owner) => {
                    tracing::debug!(pid = pid.as_raw(), "Reaped child with status {}", code);
                    let _ = owner.send(code);
                }
                None => {
                    tracing::debug!(pid = pid.as_raw(), "Reaped adopted zombie");
                    self.orphans.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn become_subreaper() {
    if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
        tracing::warn!("Failed to become child subreaper: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() {}

/// Reaper thread body: one SIGCHLD-driven loop on a private runtime
fn run() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build reaper runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async {
        let mut sigchld =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::warn!("No SIGCHLD handler, sweeping only: {}", e);
                    None
                }
            };
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            match sigchld.as_mut() {
                Some(sig) => {
                    tokio::select! {
                        _ = sig.recv() => {}
                        _ = sweep.tick() => {}
                    }
                }
                None => {
                    sweep.tick().await;
                }
            }

            let Some(reaper) = REAPER.get() else { continue };
            if catch_unwind(AssertUnwindSafe(|| reaper.reap())).is_err() {
                tracing::error!("Recovered from panic in child reaper");
            }
        }
    });
}
