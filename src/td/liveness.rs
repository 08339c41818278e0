//! Process probing and signalling by pid.
//!
//! A recorded pid may outlive the process it was recorded for, so callers that care about
//! *which* process holds the pid compare a [`ProcessIdentity`] rather than trusting existence.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_STEP: Duration = Duration::from_millis(50);
const KILL_SETTLE: Duration = Duration::from_secs(1);

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

fn proc_mounted() -> bool {
    Path::new("/proc/self/stat").exists()
}

/// Fields after the `comm` field of `/proc/<pid>/stat`; index 0 is field 3 (state).
fn proc_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    Some(after.split_whitespace().map(str::to_string).collect())
}

/// Start time of `pid` in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
pub fn start_ticks(pid: u32) -> Option<u64> {
    proc_stat_fields(pid)?.get(19)?.parse::<u64>().ok()
}

fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(pid)
        .and_then(|f| f.first().cloned())
        .map(|s| s == "Z" || s == "X")
        .unwrap_or(false)
}

/// Resolved executable of `pid`, without the kernel's ` (deleted)` marker.
pub fn exe_path(pid: u32) -> Option<PathBuf> {
    let p = fs::read_link(format!("/proc/{pid}/exe")).ok()?;
    let s = p.to_string_lossy();
    match s.strip_suffix(" (deleted)") {
        Some(stripped) => Some(PathBuf::from(stripped)),
        None => Some(p),
    }
}

/// Non-blocking existence check. EPERM counts as alive; zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    let Some(p) = to_pid(pid) else {
        return false;
    };
    match kill(p, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// What we remember about a process besides its pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub exe: Option<PathBuf>,
    pub start_ticks: Option<u64>,
}

impl ProcessIdentity {
    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = Some(exe.into());
        self
    }

    pub fn with_start_ticks(mut self, ticks: Option<u64>) -> Self {
        self.start_ticks = ticks;
        self
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    let ca = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let cb = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    ca == cb
}

/// Alive and, as far as /proc can tell, the same process we recorded.
///
/// Facts that cannot be read (no /proc) are not held against the process. An unreadable
/// executable link on a system that has /proc means another user's process, which is never ours.
pub fn matches_identity(pid: u32, expected: &ProcessIdentity) -> bool {
    if !is_alive(pid) {
        return false;
    }
    if let Some(want) = expected.start_ticks {
        if let Some(got) = start_ticks(pid) {
            if got != want {
                return false;
            }
        }
    }
    if let Some(want) = &expected.exe {
        match exe_path(pid) {
            Some(got) => {
                if !same_file(&got, want) {
                    return false;
                }
            }
            None => {
                if proc_mounted() {
                    return false;
                }
            }
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to signal.
    AlreadyGone,
    /// Exited within the grace period after SIGTERM.
    Exited,
    /// Needed SIGKILL.
    Killed,
}

/// Signal the process group when `pid` leads one, else just the pid.
fn send(pid: Pid, sig: Signal) -> nix::Result<()> {
    match getpgid(Some(pid)) {
        Ok(pg) if pg == pid => killpg(pid, sig),
        _ => kill(pid, sig),
    }
}

async fn wait_gone(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. ESRCH at any step means the process is gone.
pub async fn terminate(pid: u32, grace: Duration) -> nix::Result<Termination> {
    let Some(p) = to_pid(pid) else {
        return Ok(Termination::AlreadyGone);
    };
    if !is_alive(pid) {
        return Ok(Termination::AlreadyGone);
    }
    match send(p, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(Termination::AlreadyGone),
        Err(e) => return Err(e),
    }
    if wait_gone(pid, grace).await {
        return Ok(Termination::Exited);
    }
    tracing::debug!(pid, "still alive after {}ms grace; sending SIGKILL", grace.as_millis());
    match send(p, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(Termination::Exited),
        Err(e) => return Err(e),
    }
    wait_gone(pid, KILL_SETTLE).await;
    Ok(Termination::Killed)
}
