use crate::td::definition::{BUILTIN_TASK, DAEMON_FLAG};
use crate::td::error::{TaskError, TaskResult};
use crate::td::liveness::{self, ProcessIdentity};
use crate::td::store::{StateStore, TaskRuntimeRecord, TaskStatus};
use chrono::Local;
use std::ffi::OsString;
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

const STARTUP_WAIT: Duration = Duration::from_millis(100);

/// How to spawn the monitor daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonLaunch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub workdir: PathBuf,
}

impl DaemonLaunch {
    /// This executable, re-invoked with the daemon flag.
    pub fn current_exe(workdir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("failed to resolve own executable: {e}"))?;
        Ok(Self {
            program,
            args: vec![OsString::from(DAEMON_FLAG)],
            workdir: workdir.into(),
        })
    }

    fn identity(&self, proc_start: Option<u64>) -> ProcessIdentity {
        ProcessIdentity::default()
            .with_exe(&self.program)
            .with_start_ticks(proc_start)
    }
}

/// Starts, stops and validates the single monitor daemon, whose state lives in the shared
/// document under [`BUILTIN_TASK`].
#[derive(Debug)]
pub struct DaemonController {
    store: Arc<StateStore>,
    launch: DaemonLaunch,
    stop_grace: Duration,
}

impl DaemonController {
    pub fn new(store: Arc<StateStore>, launch: DaemonLaunch, stop_grace: Duration) -> Self {
        Self {
            store,
            launch,
            stop_grace,
        }
    }

    pub fn launch(&self) -> &DaemonLaunch {
        &self.launch
    }

    pub fn record(&self) -> anyhow::Result<Option<TaskRuntimeRecord>> {
        self.store.get(BUILTIN_TASK)
    }

    /// Running per the record, alive, and still our executable (not a recycled pid).
    pub fn validate(&self, rec: &TaskRuntimeRecord) -> bool {
        rec.claims_running() && liveness::matches_identity(rec.pid, &self.launch.identity(rec.proc_start))
    }

    pub fn running_pid(&self) -> Option<u32> {
        match self.record() {
            Ok(Some(rec)) if self.validate(&rec) => Some(rec.pid),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(target: "daemon", "cannot read daemon record: {e:#}");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    pub async fn start_daemon(&self) -> TaskResult<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(TaskError::DaemonAlreadyRunning(pid));
        }

        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args)
            .current_dir(&self.launch.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::unistd::setsid();
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(|source| TaskError::Spawn {
            name: BUILTIN_TASK.to_string(),
            executable: self.launch.program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        tokio::time::sleep(STARTUP_WAIT).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(TaskError::Other(anyhow::anyhow!(
                "daemon (pid {pid}) exited during startup: {status}"
            )));
        }

        let record = TaskRuntimeRecord::running(BUILTIN_TASK, pid, Local::now(), liveness::start_ticks(pid));
        let persisted = self.store.update(|doc| {
            // A concurrent starter may have won the race; keep its record.
            if let Some(cur) = doc.get(BUILTIN_TASK) {
                if cur.pid != pid && self.validate(cur) {
                    return Err(cur.pid);
                }
            }
            doc.upsert(record);
            Ok(())
        });
        match persisted {
            Ok(Ok(())) => {
                tracing::info!(target: "daemon", pid, "daemon started");
                // Not waited for: the daemon outlives this process.
                Ok(pid)
            }
            Ok(Err(other)) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(TaskError::DaemonAlreadyRunning(other))
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(TaskError::Other(e.context("daemon spawned but its record could not be written; killed it")))
            }
        }
    }

    pub async fn stop_daemon(&self) -> TaskResult<()> {
        let rec = self
            .record()?
            .filter(|r| r.claims_running())
            .ok_or(TaskError::DaemonNotRunning)?;

        if self.validate(&rec) {
            liveness::terminate(rec.pid, self.stop_grace)
                .await
                .map_err(|source| TaskError::Terminate {
                    name: BUILTIN_TASK.to_string(),
                    pid: rec.pid,
                    source,
                })?;
            tracing::info!(target: "daemon", pid = rec.pid, "daemon stopped");
        } else {
            tracing::warn!(target: "daemon", pid = rec.pid, "recorded daemon is gone or the pid was reused; not signalling");
        }

        self.store.update(|doc| {
            let mut r = doc
                .get(BUILTIN_TASK)
                .cloned()
                .unwrap_or_else(|| TaskRuntimeRecord::stopped(BUILTIN_TASK));
            r.mark_ended(TaskStatus::Stopped, 0, Local::now());
            r.stopped_by_operator = true;
            doc.upsert(r);
        })?;
        Ok(())
    }

    /// Start a daemon unless a valid one is recorded. Returns whether one was started.
    pub async fn ensure_running(&self) -> TaskResult<bool> {
        if self.is_running() {
            return Ok(false);
        }
        match self.start_daemon().await {
            Ok(_) => Ok(true),
            Err(TaskError::DaemonAlreadyRunning(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Called by the daemon itself at boot. Fails if a different live daemon is recorded.
    pub fn register_self(&self, pid: u32) -> TaskResult<()> {
        let record = TaskRuntimeRecord::running(BUILTIN_TASK, pid, Local::now(), liveness::start_ticks(pid));
        let res = self.store.update(|doc| {
            match doc.get(BUILTIN_TASK) {
                Some(cur) if cur.pid != pid && self.validate(cur) => return Err(cur.pid),
                // Keep the spawner's start time if it already recorded us.
                Some(cur) if cur.pid == pid && cur.claims_running() => return Ok(()),
                _ => {}
            }
            doc.upsert(record);
            Ok(())
        })?;
        res.map_err(TaskError::DaemonAlreadyRunning)
    }

    /// Called by the daemon on its way out. Leaves the record alone unless it still names `pid`.
    pub fn unregister_self(&self, pid: u32) -> anyhow::Result<()> {
        self.store.update(|doc| {
            if let Some(cur) = doc.tasks.get_mut(BUILTIN_TASK) {
                if cur.pid == pid && cur.status == TaskStatus::Running {
                    cur.mark_ended(TaskStatus::Stopped, 0, Local::now());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &std::path::Path) -> (Arc<StateStore>, DaemonController) {
        let store = Arc::new(StateStore::new(dir.join("runtime.json")));
        let launch = DaemonLaunch {
            program: which::which("sleep").unwrap(),
            args: vec![OsString::from("30")],
            workdir: dir.to_path_buf(),
        };
        let ctl = DaemonController::new(Arc::clone(&store), launch, Duration::from_secs(2));
        (store, ctl)
    }

    #[tokio::test]
    async fn start_validate_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ctl) = controller(dir.path());
        assert!(!ctl.is_running());

        let pid = ctl.start_daemon().await.unwrap();
        let rec = store.get(BUILTIN_TASK).unwrap().unwrap();
        assert_eq!(rec.pid, pid);
        assert_eq!(rec.status, TaskStatus::Running);
        assert!(ctl.is_running());
        assert!(matches!(ctl.start_daemon().await, Err(TaskError::DaemonAlreadyRunning(p)) if p == pid));
        assert!(!ctl.ensure_running().await.unwrap());

        ctl.stop_daemon().await.unwrap();
        let rec = store.get(BUILTIN_TASK).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Stopped);
        assert_eq!(rec.pid, 0);
        assert!(rec.stopped_by_operator);
        assert!(!ctl.is_running());
        assert!(!liveness::is_alive(pid));
        assert!(matches!(ctl.stop_daemon().await, Err(TaskError::DaemonNotRunning)));
    }

    #[tokio::test]
    async fn stale_and_reused_pids_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ctl) = controller(dir.path());

        // Alive, but it is the test binary, not the daemon executable.
        store
            .upsert(TaskRuntimeRecord::running(BUILTIN_TASK, std::process::id(), Local::now(), None))
            .unwrap();
        assert!(!ctl.is_running());

        store
            .upsert(TaskRuntimeRecord::running(BUILTIN_TASK, u32::MAX - 7, Local::now(), None))
            .unwrap();
        assert!(!ctl.is_running());

        assert!(ctl.ensure_running().await.unwrap());
        assert!(ctl.is_running());
        ctl.stop_daemon().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("runtime.json")));
        let launch = DaemonLaunch {
            program: PathBuf::from("/nonexistent/taskd"),
            args: vec![],
            workdir: dir.path().to_path_buf(),
        };
        let ctl = DaemonController::new(Arc::clone(&store), launch, Duration::from_secs(1));
        assert!(matches!(ctl.start_daemon().await, Err(TaskError::Spawn { .. })));
        assert!(store.get(BUILTIN_TASK).unwrap().is_none());
    }

    #[test]
    fn self_registration() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("runtime.json")));
        let launch = DaemonLaunch::current_exe(dir.path()).unwrap();
        let ctl = DaemonController::new(Arc::clone(&store), launch, Duration::from_secs(1));
        let me = std::process::id();

        ctl.register_self(me).unwrap();
        assert!(ctl.is_running());
        assert_eq!(ctl.running_pid(), Some(me));

        // Someone else booting while we are alive and recorded is refused.
        assert!(matches!(ctl.register_self(me + 1), Err(TaskError::DaemonAlreadyRunning(p)) if p == me));

        ctl.unregister_self(me + 1).unwrap();
        assert!(ctl.is_running());
        ctl.unregister_self(me).unwrap();
        let rec = store.get(BUILTIN_TASK).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Stopped);
        assert!(!rec.stopped_by_operator);
    }
}
