//! The daemon-resident polling loop: heal stale "running" records and restart auto-start tasks.

use crate::td::context::Services;
use crate::td::definition::{is_builtin, TaskConfig};
use crate::td::error::TaskError;
use crate::td::manager::{Manager, Role, StartKind};
use crate::td::restart::{self, RestartDecision};
use crate::td::store::TaskRuntimeRecord;
use chrono::Local;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How long a tick waits for one of our own exited children to be reaped.
const REAP_WAIT: Duration = Duration::from_millis(500);

/// What one pass of the monitor did, by task name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Recorded as running but found dead.
    pub exited: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
    /// Notices emitted this tick (each name at most once until its counter is reset).
    pub limit_reached: Vec<String>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.exited.is_empty() && self.restarted.is_empty() && self.failed.is_empty() && self.limit_reached.is_empty()
    }
}

pub struct TaskMonitor {
    manager: Arc<Manager>,
    interval: Duration,
    limit_notified: HashSet<String>,
}

impl TaskMonitor {
    pub fn new(manager: Arc<Manager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            limit_notified: HashSet::new(),
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Poll until `cancel` fires. The first pass runs immediately.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(target: "monitor", interval_ms = self.interval.as_millis() as u64, "monitor loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.is_quiet() {
                        tracing::debug!(target: "monitor", ?report, "tick");
                    }
                }
            }
        }
        tracing::info!(target: "monitor", "monitor loop stopped");
    }

    /// One reconciliation pass. Errors are logged per task and never abort the pass.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let defs = match self.manager.refresh_definitions() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(target: "monitor", "cannot read task definitions: {e:#}");
                return report;
            }
        };
        let doc = match self.manager.store().load() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(target: "monitor", "cannot read state: {e:#}");
                return report;
            }
        };

        let names: BTreeSet<&String> = doc
            .tasks
            .keys()
            .filter(|n| !is_builtin(n))
            .chain(defs.iter().filter(|(_, c)| c.auto_start).map(|(n, _)| n))
            .collect();

        for name in names {
            let outcome = self.check_task(name, defs.get(name), doc.get(name), &mut report).await;
            if let Err(e) = outcome {
                tracing::warn!(target: "monitor", task = %name, "check failed: {e:#}");
            }
        }
        report
    }

    async fn check_task(
        &mut self,
        name: &str,
        cfg: Option<&TaskConfig>,
        rec: Option<&TaskRuntimeRecord>,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let rec = match rec {
            Some(r) if r.claims_running() => match self.heal_if_dead(name, r).await? {
                Some(updated) => {
                    report.exited.push(name.to_string());
                    updated
                }
                None => return Ok(()),
            },
            Some(r) => r.clone(),
            None => {
                // Never started: an auto-start task gets its first start from here.
                let Some(cfg) = cfg else { return Ok(()) };
                if cfg.auto_start {
                    self.restart(name, StartKind::Manual, report);
                }
                return Ok(());
            }
        };

        let Some(cfg) = cfg else { return Ok(()) };
        match restart::decide(cfg, &rec, Local::now()) {
            RestartDecision::Restart => self.restart(name, StartKind::AutoRestart, report),
            RestartDecision::LimitReached => {
                if self.limit_notified.insert(name.to_string()) {
                    tracing::warn!(
                        target: "monitor",
                        task = %name,
                        retry_num = rec.retry_count,
                        max_retry_num = cfg.max_retry,
                        "retry limit reached; not restarting until started manually"
                    );
                    report.limit_reached.push(name.to_string());
                }
            }
            RestartDecision::Wait(left) => {
                tracing::debug!(target: "monitor", task = %name, left_ms = left.as_millis() as u64, "restart delayed");
            }
            RestartDecision::Idle => {
                self.limit_notified.remove(name);
            }
        }
        Ok(())
    }

    /// Returns the stopped record if the recorded process is gone, `None` if it is still alive.
    async fn heal_if_dead(&self, name: &str, rec: &TaskRuntimeRecord) -> anyhow::Result<Option<TaskRuntimeRecord>> {
        if let Some(t) = self.manager.task_handle(name).filter(|t| t.snapshot().pid == rec.pid) {
            t.wait_reaped(REAP_WAIT).await;
        }
        if self.manager.record_alive(name, rec) {
            // Spawned by a command process: watch it from here on.
            if let Some(t) = self.manager.task_handle(name) {
                if !t.is_running() {
                    t.restore_runtime_state(rec);
                }
            }
            return Ok(None);
        }

        let updated = self.manager.mark_gone(name, rec)?;
        let exit_code = updated.as_ref().map(|r| r.exit_code).unwrap_or(0);
        tracing::info!(target: "monitor", task = %name, pid = rec.pid, exit_code, "process is gone");
        Ok(updated.filter(|r| !r.claims_running()))
    }

    fn restart(&mut self, name: &str, kind: StartKind, report: &mut TickReport) {
        match self.manager.launch(name, kind) {
            Ok(rec) => {
                tracing::info!(target: "monitor", task = %name, pid = rec.pid, retry_num = rec.retry_count, "restarted");
                report.restarted.push(name.to_string());
            }
            Err(TaskError::AlreadyRunning(_)) => {}
            Err(TaskError::StoppedByOperator(_)) => {
                tracing::debug!(target: "monitor", task = %name, "operator stop came first; not restarting");
            }
            Err(e) => {
                tracing::warn!(target: "monitor", task = %name, "restart failed: {e}");
                report.failed.push(name.to_string());
            }
        }
    }
}

fn spawn_signal_listener(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => tracing::info!(target: "daemon", "SIGTERM received"),
            _ = int.recv() => tracing::info!(target: "daemon", "SIGINT received"),
        }
        cancel.cancel();
    });
    Ok(())
}

/// Body of `taskd --daemon`. Returns once a termination signal stopped the loop.
pub async fn run_daemon(services: Arc<Services>) -> anyhow::Result<()> {
    let pid = std::process::id();
    tracing::info!(target: "daemon", pid, home = %services.paths.home.display(), "{}", crate::td::build_info::banner());

    match services.daemon.register_self(pid) {
        Ok(()) => {}
        Err(TaskError::DaemonAlreadyRunning(other)) => {
            tracing::warn!(target: "daemon", other, "another daemon is already running; exiting");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    let manager = Manager::load(Arc::clone(&services), Role::Daemon)?;
    let mut monitor = TaskMonitor::new(Arc::clone(&manager), services.settings.monitor_interval);
    monitor.run(cancel).await;

    if let Err(e) = services.daemon.unregister_self(pid) {
        tracing::warn!(target: "daemon", "failed to clear daemon record: {e:#}");
    }
    manager.shutdown().await;
    tracing::info!(target: "daemon", pid, "daemon exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::config::{Paths, Settings};
    use crate::td::daemon::DaemonLaunch;
    use crate::td::liveness;
    use crate::td::store::TaskStatus;
    use std::io::Write as _;

    fn services(dir: &std::path::Path) -> Arc<Services> {
        let settings = Settings {
            daemon_autostart: false,
            stop_grace: Duration::from_secs(1),
            ..Settings::default()
        };
        let launch = DaemonLaunch {
            program: which::which("sleep").unwrap(),
            args: vec!["30".into()],
            workdir: dir.to_path_buf(),
        };
        Services::with_launch(Paths::new(dir.join("home")), settings, launch)
    }

    fn sleeper(name: &str, auto_start: bool, max_retry: u32) -> TaskConfig {
        let mut cfg = TaskConfig::new(name, "sleep 30");
        cfg.workdir = Some(std::env::temp_dir());
        cfg.auto_start = auto_start;
        cfg.max_retry = max_retry;
        cfg
    }

    async fn kill_and_wait(pid: u32) {
        liveness::terminate(pid, Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn dead_process_is_restarted_in_the_same_tick() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        let cmd = Manager::load(Arc::clone(&svc), Role::Command).unwrap();
        cmd.add_task(sleeper("t1", true, 3)).unwrap();
        let first = cmd.start_task("t1").await.unwrap();
        cmd.shutdown().await;

        let daemon = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        let mut mon = TaskMonitor::new(Arc::clone(&daemon), Duration::from_secs(5));
        assert!(mon.tick().await.is_quiet());

        kill_and_wait(first.pid).await;
        let report = mon.tick().await;
        assert_eq!(report.exited, vec!["t1".to_string()]);
        assert_eq!(report.restarted, vec!["t1".to_string()]);

        let rec = svc.store.get("t1").unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Running);
        assert_eq!(rec.retry_count, 1);
        assert_ne!(rec.pid, first.pid);
        daemon.stop_task("t1").await.unwrap();
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn limit_notice_is_emitted_once() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        let m = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        m.add_task(sleeper("t1", true, 2)).unwrap();
        let mut rec = TaskRuntimeRecord::stopped("t1");
        rec.retry_count = 2;
        svc.store.upsert(rec).unwrap();

        let mut mon = TaskMonitor::new(Arc::clone(&m), Duration::from_secs(5));
        assert_eq!(mon.tick().await.limit_reached, vec!["t1".to_string()]);
        assert!(mon.tick().await.is_quiet());
        assert_eq!(svc.store.get("t1").unwrap().unwrap().status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn operator_stop_and_non_auto_tasks_stay_down() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        let m = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        m.add_task(sleeper("auto", true, 3)).unwrap();
        m.add_task(sleeper("manual", false, 3)).unwrap();
        m.start_task("auto").await.unwrap();
        m.stop_task("auto").await.unwrap();
        let info = m.start_task("manual").await.unwrap();
        kill_and_wait(info.pid).await;

        let mut mon = TaskMonitor::new(Arc::clone(&m), Duration::from_secs(5));
        let report = mon.tick().await;
        assert!(report.restarted.is_empty());
        for name in ["auto", "manual"] {
            assert_eq!(svc.store.get(name).unwrap().unwrap().status, TaskStatus::Stopped);
        }
    }

    #[tokio::test]
    async fn failed_restart_keeps_retry_count_and_other_tasks_proceed() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        let m = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        let mut broken = TaskConfig::new("broken", "/nonexistent/bin/thing");
        broken.workdir = Some(std::env::temp_dir());
        broken.auto_start = true;
        m.add_task(broken).unwrap();
        m.add_task(sleeper("fine", true, 3)).unwrap();
        let mut rec = TaskRuntimeRecord::stopped("broken");
        rec.retry_count = 1;
        svc.store.upsert(rec).unwrap();

        let mut mon = TaskMonitor::new(Arc::clone(&m), Duration::from_secs(5));
        let report = mon.tick().await;
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(report.restarted, vec!["fine".to_string()]);

        let rec = svc.store.get("broken").unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Stopped);
        assert_eq!(rec.exit_code, -1);
        assert_eq!(rec.retry_count, 1);
        // First start of a never-recorded auto-start task does not count as a retry.
        assert_eq!(svc.store.get("fine").unwrap().unwrap().retry_count, 0);
        m.stop_task("fine").await.unwrap();
        m.shutdown().await;
    }

    #[tokio::test]
    async fn orphan_records_are_healed_and_bad_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        svc.paths.ensure_dirs().unwrap();
        let mut f = std::fs::File::create(svc.paths.tasks_dir.join("junk.yaml")).unwrap();
        writeln!(f, "executable: [unterminated").unwrap();
        svc.store
            .upsert(TaskRuntimeRecord::running("ghost", u32::MAX - 11, Local::now(), None))
            .unwrap();

        let m = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        let mut mon = TaskMonitor::new(m, Duration::from_secs(5));
        let report = mon.tick().await;
        assert_eq!(report.exited, vec!["ghost".to_string()]);
        let rec = svc.store.get("ghost").unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Stopped);
        assert_eq!(rec.pid, 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let svc = services(dir.path());
        let m = Manager::load(Arc::clone(&svc), Role::Daemon).unwrap();
        let mut mon = TaskMonitor::new(m, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            c2.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), mon.run(cancel)).await.unwrap();
    }
}
