use crate::td::asyncutil::TaskTracker;
use crate::td::definition::TaskConfig;
use crate::td::error::{TaskError, TaskResult};
use crate::td::liveness::{self, ProcessIdentity, Termination};
use crate::td::stdio::TaskIo;
use crate::td::store::{TaskRuntimeRecord, TaskStatus};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::os::unix::process::ExitStatusExt as _;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// How often an adopted (not spawned by us) process is polled for liveness.
const ADOPTED_POLL: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(10);

pub const STOPPED_BY_USER: &str = "terminated by user";

/// Reported once per process when it is seen to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub name: String,
    pub pid: u32,
    pub exit_code: i32,
    pub error: Option<String>,
    pub at: DateTime<Local>,
}

pub type ExitCallback = Arc<dyn Fn(TaskExit) + Send + Sync>;

/// Point-in-time view of a task for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub pid: u32,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub exit_code: i32,
    pub last_error: Option<String>,
    /// The process is a child of this supervisor process (as opposed to adopted by pid).
    pub owned: bool,
}

#[derive(Debug, Default)]
struct TaskState {
    status: TaskStatus,
    pid: u32,
    proc_start: Option<u64>,
    start_time: Option<DateTime<Local>>,
    end_time: Option<DateTime<Local>>,
    exit_code: i32,
    last_error: Option<String>,
    /// Bumped on every start/stop/adopt so a stale reaper cannot overwrite newer state.
    epoch: u64,
    owned: bool,
    last_exit: Option<TaskExit>,
    io: Option<TaskIo>,
}

impl TaskState {
    fn release_io(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.release();
        }
    }
}

fn describe_exit(status: ExitStatus) -> (i32, Option<String>) {
    if let Some(code) = status.code() {
        let err = (code != 0).then(|| format!("exit status {code}"));
        return (code, err);
    }
    match status.signal() {
        Some(sig) => {
            let name = nix::sys::signal::Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string());
            (-1, Some(format!("terminated by signal {name}")))
        }
        None => (-1, Some(format!("abnormal exit: {status}"))),
    }
}

/// One configured command and, while it runs, its OS process.
pub struct Task {
    config: RwLock<TaskConfig>,
    state: Mutex<TaskState>,
    tracker: TaskTracker,
    on_exit: Option<ExitCallback>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    pub fn new(config: TaskConfig, tracker: TaskTracker, on_exit: Option<ExitCallback>) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            state: Mutex::new(TaskState::default()),
            tracker,
            on_exit,
        })
    }

    pub fn name(&self) -> String {
        self.config.read().unwrap_or_else(|p| p.into_inner()).name.clone()
    }

    pub fn config(&self) -> TaskConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Takes effect on the next start.
    pub fn set_config(&self, cfg: TaskConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = cfg;
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        TaskSnapshot {
            status: st.status,
            pid: st.pid,
            start_time: st.start_time,
            end_time: st.end_time,
            exit_code: st.exit_code,
            last_error: st.last_error.clone(),
            owned: st.owned,
        }
    }

    /// The most recent exit this process observed, if any.
    pub fn last_exit(&self) -> Option<TaskExit> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).last_exit.clone()
    }

    /// The record to persist while running; `None` once stopped so no stale pid is written.
    pub fn runtime_info(&self) -> Option<TaskRuntimeRecord> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.status != TaskStatus::Running || st.pid == 0 {
            return None;
        }
        Some(TaskRuntimeRecord::running(
            self.name(),
            st.pid,
            st.start_time.unwrap_or_else(Local::now),
            st.proc_start,
        ))
    }

    /// Spawn the process and a reaper bound to it. Returns as soon as the spawn succeeded.
    pub fn start(self: &Arc<Self>) -> TaskResult<TaskRuntimeRecord> {
        let cfg = self.config();
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.status == TaskStatus::Running {
            return Err(TaskError::AlreadyRunning(cfg.name.clone()));
        }

        let fail = |st: &mut TaskState, err: TaskError| -> TaskResult<TaskRuntimeRecord> {
            st.status = TaskStatus::Failed;
            st.pid = 0;
            st.proc_start = None;
            st.exit_code = -1;
            st.end_time = Some(Local::now());
            st.last_error = Some(err.to_string());
            tracing::warn!(target: "task", task = %cfg.name, "start failed: {err}");
            Err(err)
        };
        let spawn_err = |source: std::io::Error| TaskError::Spawn {
            name: cfg.name.clone(),
            executable: cfg.executable.clone(),
            source,
        };

        let (program, args) = match cfg.command_line() {
            Ok(v) => v,
            Err(e) => return fail(&mut *st, e),
        };
        let workdir = cfg.resolved_workdir();
        let io = match TaskIo::open(&cfg.io_info()) {
            Ok(io) => io,
            Err(e) => return fail(&mut *st, spawn_err(std::io::Error::other(format!("{e:#}")))),
        };

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args).current_dir(&workdir).kill_on_drop(false);
        if !cfg.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(cfg.env_pairs());
        if let Err(e) = io.attach(&mut cmd) {
            return fail(&mut *st, spawn_err(std::io::Error::other(format!("{e:#}"))));
        }
        // Own session: detached from the caller's terminal, and a process group to signal as a whole.
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::unistd::setsid();
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return fail(&mut *st, spawn_err(e)),
        };
        let pid = child.id().unwrap_or(0);
        let now = Local::now();
        st.status = TaskStatus::Running;
        st.pid = pid;
        st.proc_start = liveness::start_ticks(pid);
        st.start_time = Some(now);
        st.end_time = None;
        st.exit_code = 0;
        st.last_error = None;
        st.epoch += 1;
        st.owned = true;
        st.io = Some(io);
        let epoch = st.epoch;
        let record = TaskRuntimeRecord::running(&cfg.name, pid, now, st.proc_start);
        drop(st);

        tracing::info!(target: "task", task = %cfg.name, pid, "started {}", cfg.display_command());
        self.spawn_reaper(child, epoch);
        Ok(record)
    }

    fn spawn_reaper(self: &Arc<Self>, mut child: tokio::process::Child, epoch: u64) {
        let task = Arc::clone(self);
        let token = self.tracker.shutdown_token();
        self.tracker.spawn(async move {
            tokio::select! {
                res = child.wait() => {
                    let (code, err) = match res {
                        Ok(status) => describe_exit(status),
                        Err(e) => (-1, Some(format!("wait failed: {e}"))),
                    };
                    task.finish(epoch, code, err);
                }
                // Supervisor shutting down; the process lives on and is re-adopted from the state file.
                _ = token.cancelled() => {}
            }
        });
    }

    /// Re-attach to a process recorded as running by another supervisor process.
    ///
    /// Nothing is spawned. Since the process is not our child, exit is detected by polling.
    pub fn restore_runtime_state(self: &Arc<Self>, record: &TaskRuntimeRecord) -> bool {
        if !record.claims_running() {
            return false;
        }
        let identity = ProcessIdentity::default().with_start_ticks(record.proc_start);
        if !liveness::matches_identity(record.pid, &identity) {
            return false;
        }
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.status == TaskStatus::Running {
            return false;
        }
        st.status = TaskStatus::Running;
        st.pid = record.pid;
        st.proc_start = record.proc_start;
        st.start_time = record.start_time;
        st.end_time = None;
        st.exit_code = 0;
        st.last_error = None;
        st.epoch += 1;
        st.owned = false;
        let epoch = st.epoch;
        drop(st);

        tracing::debug!(target: "task", task = %record.name, pid = record.pid, "adopted running process");
        self.spawn_watcher(record.pid, identity, epoch);
        true
    }

    fn spawn_watcher(self: &Arc<Self>, pid: u32, identity: ProcessIdentity, epoch: u64) {
        let task = Arc::clone(self);
        let token = self.tracker.shutdown_token();
        self.tracker.spawn(async move {
            let mut tick = tokio::time::interval(ADOPTED_POLL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        if task.current_epoch() != epoch {
                            return;
                        }
                        if !liveness::matches_identity(pid, &identity) {
                            // The exit status of a process that is not our child is unobservable.
                            task.finish(epoch, 0, None);
                            return;
                        }
                    }
                }
            }
        });
    }

    fn current_epoch(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).epoch
    }

    /// Re-check a running task's pid right now instead of waiting for the reaper or watcher.
    /// Returns false when the process turned out to be gone.
    ///
    /// Only adopted processes are finished here. A child of ours stays running until its
    /// reaper has collected the real exit status.
    pub fn check_alive(&self) -> bool {
        let (pid, identity, epoch, owned) = {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.status != TaskStatus::Running {
                return false;
            }
            (st.pid, ProcessIdentity::default().with_start_ticks(st.proc_start), st.epoch, st.owned)
        };
        if owned || liveness::matches_identity(pid, &identity) {
            return true;
        }
        self.finish(epoch, 0, None);
        false
    }

    /// Give the reaper of an exited child of ours up to `limit` to record its exit status.
    /// Returns immediately for live processes and adopted ones.
    pub async fn wait_reaped(&self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let (pid, identity, owned) = {
                let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if st.status != TaskStatus::Running {
                    return;
                }
                (st.pid, ProcessIdentity::default().with_start_ticks(st.proc_start), st.owned)
            };
            if !owned || liveness::matches_identity(pid, &identity) || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
    }

    /// running -> stopped transition for an observed exit, then the exit callback.
    fn finish(&self, epoch: u64, exit_code: i32, error: Option<String>) {
        let exit = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.epoch != epoch || st.status != TaskStatus::Running {
                return;
            }
            let pid = st.pid;
            let now = Local::now();
            st.status = TaskStatus::Stopped;
            st.pid = 0;
            st.proc_start = None;
            st.exit_code = exit_code;
            st.last_error = error.clone();
            st.end_time = Some(now);
            st.release_io();
            let exit = TaskExit {
                name: self.name(),
                pid,
                exit_code,
                error,
                at: now,
            };
            st.last_exit = Some(exit.clone());
            exit
        };
        match &exit.error {
            Some(e) => tracing::info!(target: "task", task = %exit.name, pid = exit.pid, exit_code, "process exited: {e}"),
            None => tracing::info!(target: "task", task = %exit.name, pid = exit.pid, exit_code, "process exited"),
        }
        if let Some(cb) = &self.on_exit {
            cb(exit);
        }
    }

    /// SIGTERM, then SIGKILL after `grace`. The task is marked stopped right away; an already
    /// dead process is not an error.
    pub async fn stop(&self, grace: Duration) -> TaskResult<()> {
        let name = self.name();
        let (pid, identity) = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.status != TaskStatus::Running {
                return Err(TaskError::NotRunning(name));
            }
            let pid = st.pid;
            let identity = ProcessIdentity::default().with_start_ticks(st.proc_start);
            st.epoch += 1;
            st.status = TaskStatus::Stopped;
            st.pid = 0;
            st.proc_start = None;
            st.exit_code = -1;
            st.last_error = Some(STOPPED_BY_USER.to_string());
            st.end_time = Some(Local::now());
            st.release_io();
            (pid, identity)
        };

        if !liveness::matches_identity(pid, &identity) {
            tracing::info!(target: "task", task = %name, pid, "process already gone");
            return Ok(());
        }
        match liveness::terminate(pid, grace).await {
            Ok(Termination::Killed) => {
                tracing::warn!(target: "task", task = %name, pid, "did not exit on SIGTERM; killed");
                Ok(())
            }
            Ok(_) => {
                tracing::info!(target: "task", task = %name, pid, "stopped");
                Ok(())
            }
            Err(source) => Err(TaskError::Terminate { name, pid, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sleep_config(name: &str, secs: &str) -> TaskConfig {
        let mut cfg = TaskConfig::new(name, which::which("sleep").unwrap().display().to_string());
        cfg.args = vec![secs.to_string()];
        cfg.workdir = Some(std::env::temp_dir());
        cfg
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_then_stop() {
        let tracker = TaskTracker::new();
        let task = Task::new(sleep_config("s", "30"), tracker.clone(), None);

        let rec = task.start().unwrap();
        assert!(rec.claims_running());
        assert!(liveness::is_alive(rec.pid));
        assert_eq!(task.runtime_info().unwrap().pid, rec.pid);
        assert!(matches!(task.start(), Err(TaskError::AlreadyRunning(_))));

        task.stop(Duration::from_secs(2)).await.unwrap();
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Stopped);
        assert_eq!(snap.exit_code, -1);
        assert_eq!(snap.last_error.as_deref(), Some(STOPPED_BY_USER));
        assert!(task.runtime_info().is_none());
        assert!(wait_until(|| !liveness::is_alive(rec.pid)).await);
        assert!(matches!(task.stop(Duration::from_secs(1)).await, Err(TaskError::NotRunning(_))));

        tracker.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let mut cfg = TaskConfig::new("bad", "/nonexistent/definitely/not/here");
        cfg.workdir = Some(std::env::temp_dir());
        let task = Task::new(cfg, TaskTracker::new(), None);
        let err = task.start().unwrap_err();
        assert!(matches!(err, TaskError::Spawn { .. }), "{err}");
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.last_error.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn reaper_reports_exit_code_through_callback() {
        let (tx, rx) = mpsc::channel::<TaskExit>();
        let tx = Mutex::new(tx);
        let cb: ExitCallback = Arc::new(move |exit| {
            let _ = tx.lock().unwrap().send(exit);
        });
        let mut cfg = TaskConfig::new("quick", "/bin/sh -c 'exit 3'");
        cfg.workdir = Some(std::env::temp_dir());
        let task = Task::new(cfg, TaskTracker::new(), Some(cb));
        let rec = task.start().unwrap();

        let exit = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.pid, rec.pid);
        assert_eq!(exit.exit_code, 3);
        assert_eq!(exit.error.as_deref(), Some("exit status 3"));
        assert_eq!(task.status(), TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn polling_an_exited_child_keeps_its_real_exit_code() {
        let mut cfg = TaskConfig::new("seven", "/bin/sh -c 'exit 7'");
        cfg.workdir = Some(std::env::temp_dir());
        let task = Task::new(cfg, TaskTracker::new(), None);
        let rec = task.start().unwrap();

        // Poll as hard as the monitor and readers could; the zombie must not be finished with 0.
        for _ in 0..2000 {
            if !task.check_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        task.wait_reaped(Duration::from_secs(5)).await;
        assert_eq!(task.status(), TaskStatus::Stopped);
        assert_eq!(task.snapshot().exit_code, 7);
        let exit = task.last_exit().unwrap();
        assert_eq!(exit.pid, rec.pid);
        assert_eq!(exit.exit_code, 7);
    }

    #[tokio::test]
    async fn signal_death_is_minus_one() {
        let task = Task::new(sleep_config("k", "30"), TaskTracker::new(), None);
        let rec = task.start().unwrap();
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(rec.pid as i32), nix::sys::signal::Signal::SIGKILL).unwrap();
        assert!(wait_until(|| task.status() == TaskStatus::Stopped).await);
        let snap = task.snapshot();
        assert_eq!(snap.exit_code, -1);
        assert!(snap.last_error.unwrap().contains("SIGKILL"));
    }

    #[tokio::test]
    async fn environment_overrides_and_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = TaskConfig::new("env", "/bin/sh -c 'echo \"$FOO|$HOME\"'");
        cfg.workdir = Some(dir.path().to_path_buf());
        cfg.stdout = Some("out.log".to_string());
        cfg.env = vec!["FOO=bar".to_string(), "HOME=/override".to_string()];
        let task = Task::new(cfg.clone(), TaskTracker::new(), None);
        task.start().unwrap();
        assert!(wait_until(|| task.status() == TaskStatus::Stopped).await);

        cfg.inherit_env = false;
        cfg.env = vec!["FOO=baz".to_string()];
        task.set_config(cfg);
        task.start().unwrap();
        assert!(wait_until(|| task.status() == TaskStatus::Stopped).await);

        let out = std::fs::read_to_string(dir.path().join("out.log")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["bar|/override", "baz|"]);
    }

    #[tokio::test]
    async fn adopts_foreign_process_and_notices_exit() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let (tx, rx) = mpsc::channel::<TaskExit>();
        let tx = Mutex::new(tx);
        let cb: ExitCallback = Arc::new(move |exit| {
            let _ = tx.lock().unwrap().send(exit);
        });
        let task = Task::new(sleep_config("adopt", "30"), TaskTracker::new(), Some(cb));

        let rec = TaskRuntimeRecord::running("adopt", pid, Local::now(), liveness::start_ticks(pid));
        assert!(task.restore_runtime_state(&rec));
        assert!(task.is_running());
        assert!(!task.snapshot().owned);
        assert!(matches!(task.start(), Err(TaskError::AlreadyRunning(_))));

        child.kill().unwrap();
        child.wait().unwrap();
        let exit = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.pid, pid);
        assert_eq!(task.status(), TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn restore_rejects_dead_or_reused_pids() {
        let task = Task::new(sleep_config("r", "1"), TaskTracker::new(), None);
        let dead = TaskRuntimeRecord::running("r", u32::MAX - 1, Local::now(), None);
        assert!(!task.restore_runtime_state(&dead));

        let me = std::process::id();
        let reused = TaskRuntimeRecord::running("r", me, Local::now(), liveness::start_ticks(me).map(|t| t + 1));
        if reused.proc_start.is_some() {
            assert!(!task.restore_runtime_state(&reused));
        }
        assert_eq!(task.status(), TaskStatus::Stopped);
    }
}
