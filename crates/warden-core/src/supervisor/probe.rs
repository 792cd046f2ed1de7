//! OS process liveness and signalling.
//!
//! Orphan detection goes through [`ProcessProbe`]; nothing here parses the
//! output of `ps` or other shell tools. A PID only counts as a run's worker
//! when the process still carries that run's id in its environment, so a
//! recycled PID is never signalled.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};
use uuid::Uuid;

use super::launcher::RUN_ID_ENV;
use crate::domain::SupervisorError;

/// Capability to remember which OS process serves a run and to find it again
/// after a restart.
pub trait ProcessProbe: Send + Sync {
    /// Remember that `pid` serves `run_id`.
    fn record(&self, run_id: Uuid, pid: u32) -> std::io::Result<()>;

    /// Forget `run_id`. Missing entries are ignored.
    fn forget(&self, run_id: Uuid);

    /// PID of a live process that is `run_id`'s worker, if any.
    fn find_live(&self, run_id: Uuid) -> Option<i32>;
}

/// One `<dir>/<run_id>.pid` file per run; liveness via the null signal,
/// identity via `/proc/<pid>/environ`.
///
/// Where `/proc` is unavailable or unreadable no process matches, and
/// reconcile only repairs the store.
#[derive(Debug, Clone)]
pub struct PidFileProbe {
    dir: PathBuf,
}

impl PidFileProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Probe rooted at `<state_dir>/pids`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("pids"))
    }

    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.pid"))
    }
}

impl ProcessProbe for PidFileProbe {
    fn record(&self, run_id: Uuid, pid: u32) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(run_id), format!("{pid}\n"))
    }

    fn forget(&self, run_id: Uuid) {
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(%run_id, error = %e, "failed to remove pid file"),
        }
    }

    fn find_live(&self, run_id: Uuid) -> Option<i32> {
        let raw = fs::read_to_string(self.path_for(run_id)).ok()?;
        let pid = raw.trim().parse::<i32>().ok().filter(|p| *p > 0)?;
        if !is_alive(pid) {
            return None;
        }
        if !carries_run_id(pid, run_id) {
            debug!(%run_id, pid, "pid file points at an unrelated process");
            return None;
        }
        Some(pid)
    }
}

/// Whether `pid`'s environment holds `WARDEN_RUN_ID=<run_id>`.
pub fn carries_run_id(pid: i32, run_id: Uuid) -> bool {
    let Ok(environ) = fs::read(format!("/proc/{pid}/environ")) else {
        return false;
    };
    let marker = format!("{RUN_ID_ENV}={run_id}");
    environ
        .split(|b| *b == 0)
        .any(|entry| entry == marker.as_bytes())
}

/// Whether `pid` exists. A process owned by another user still counts.
pub fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn send_signal(pid: i32, signal: Signal) -> Result<(), SupervisorError> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// SIGTERM, poll for exit up to `grace`, then SIGKILL.
///
/// For processes this instance did not spawn and so cannot `wait` on.
/// Returns whether the process is gone.
pub async fn terminate_pid(pid: i32, grace: Duration) -> bool {
    if let Err(e) = send_signal(pid, Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM failed");
    }
    if wait_gone(pid, grace).await {
        return true;
    }
    debug!(pid, "escalating to SIGKILL");
    if let Err(e) = send_signal(pid, Signal::SIGKILL) {
        warn!(pid, error = %e, "SIGKILL failed");
    }
    wait_gone(pid, Duration::from_secs(2)).await
}

async fn wait_gone(pid: i32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
