//! End-to-end supervision scenarios. Each "invocation" is a fresh `Manager` over the same
//! home directory, the way separate `taskd` command processes share `runtime.json`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskd::td::config::{Paths, Settings};
use taskd::td::context::Services;
use taskd::td::daemon::DaemonLaunch;
use taskd::td::definition::{TaskConfig, BUILTIN_TASK};
use taskd::td::error::{BuiltinOp, TaskError};
use taskd::td::liveness;
use taskd::td::manager::{Manager, Role};
use taskd::td::monitor::TaskMonitor;
use taskd::td::store::{TaskRuntimeRecord, TaskStatus};
use tempfile::TempDir;

struct Home {
    _dir: TempDir,
    services: Arc<Services>,
}

impl Home {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            daemon_autostart: false,
            stop_grace: Duration::from_secs(1),
            ..Settings::default()
        };
        let launch = DaemonLaunch {
            program: which::which("sleep").unwrap(),
            args: vec!["60".into()],
            workdir: dir.path().to_path_buf(),
        };
        let services = Services::with_launch(Paths::new(dir.path().join("home")), settings, launch);
        Self { _dir: dir, services }
    }

    fn invocation(&self, role: Role) -> Arc<Manager> {
        Manager::load(Arc::clone(&self.services), role).unwrap()
    }

    fn record(&self, name: &str) -> TaskRuntimeRecord {
        self.services.store.get(name).unwrap().unwrap()
    }
}

fn sleeper(name: &str, auto_start: bool, max_retry: u32) -> TaskConfig {
    let mut cfg = TaskConfig::new(name, format!("{} 60", which::which("sleep").unwrap().display()));
    cfg.workdir = Some(std::env::temp_dir());
    cfg.auto_start = auto_start;
    cfg.max_retry = max_retry;
    cfg
}

async fn kill_externally(pid: u32) {
    liveness::terminate(pid, Duration::from_millis(200)).await.unwrap();
}

#[tokio::test]
async fn crashed_task_is_restarted_once_per_tick() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    cmd.add_task(sleeper("t1", true, 3)).unwrap();
    let started = cmd.start_task("t1").await.unwrap();
    assert_eq!(home.record("t1").retry_count, 0);
    cmd.shutdown().await;

    let daemon = home.invocation(Role::Daemon);
    let mut monitor = TaskMonitor::new(Arc::clone(&daemon), Duration::from_secs(5));
    kill_externally(started.pid).await;

    let report = monitor.tick().await;
    assert_eq!(report.restarted, vec!["t1".to_string()]);
    let rec = home.record("t1");
    assert_eq!(rec.status, TaskStatus::Running);
    assert_eq!(rec.retry_count, 1);
    assert_ne!(rec.pid, started.pid);
    assert!(liveness::is_alive(rec.pid));

    daemon.stop_task("t1").await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn retry_limit_stops_restarts_until_manual_start() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    cmd.add_task(sleeper("t1", true, 3)).unwrap();
    cmd.start_task("t1").await.unwrap();
    cmd.shutdown().await;

    let daemon = home.invocation(Role::Daemon);
    let mut monitor = TaskMonitor::new(Arc::clone(&daemon), Duration::from_secs(5));
    for expected in 1..=3 {
        kill_externally(home.record("t1").pid).await;
        let report = monitor.tick().await;
        assert_eq!(report.restarted, vec!["t1".to_string()]);
        assert_eq!(home.record("t1").retry_count, expected);
    }

    kill_externally(home.record("t1").pid).await;
    let report = monitor.tick().await;
    assert!(report.restarted.is_empty());
    assert_eq!(report.limit_reached, vec!["t1".to_string()]);
    let rec = home.record("t1");
    assert_eq!(rec.status, TaskStatus::Stopped);
    assert_eq!(rec.retry_count, 3);
    assert_eq!(rec.pid, 0);

    // No repeated notice, no further attempts.
    assert!(monitor.tick().await.is_quiet());

    // A manual start resets the counter and re-arms supervision.
    let cmd = home.invocation(Role::Command);
    cmd.start_task("t1").await.unwrap();
    assert_eq!(home.record("t1").retry_count, 0);
    cmd.stop_task("t1").await.unwrap();
    cmd.shutdown().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn operator_stop_is_never_undone_by_the_monitor() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    cmd.add_task(sleeper("t1", true, 0)).unwrap();
    let started = cmd.start_task("t1").await.unwrap();
    cmd.stop_task("t1").await.unwrap();
    cmd.shutdown().await;
    assert!(!liveness::is_alive(started.pid));

    let daemon = home.invocation(Role::Daemon);
    let mut monitor = TaskMonitor::new(Arc::clone(&daemon), Duration::from_secs(5));
    for _ in 0..3 {
        assert!(monitor.tick().await.restarted.is_empty());
    }
    let rec = home.record("t1");
    assert_eq!(rec.status, TaskStatus::Stopped);
    assert!(rec.stopped_by_operator);
}

#[tokio::test]
async fn operator_stop_holds_while_the_monitor_is_ticking() {
    for _ in 0..5 {
        let home = Home::new();
        let cmd = home.invocation(Role::Command);
        cmd.add_task(sleeper("t1", true, 0)).unwrap();
        cmd.shutdown().await;

        // The daemon owns the process, so its reaper sees the exit the operator causes.
        let daemon = home.invocation(Role::Daemon);
        let mut monitor = TaskMonitor::new(Arc::clone(&daemon), Duration::from_millis(5));
        assert_eq!(monitor.tick().await.restarted, vec!["t1".to_string()]);
        let mut seen = vec![home.record("t1").pid];

        let operator = home.invocation(Role::Command);
        let stopped = AtomicBool::new(false);
        let stop = async {
            let res = operator.stop_task("t1").await;
            stopped.store(true, Ordering::SeqCst);
            res
        };
        let ticks = async {
            while !stopped.load(Ordering::SeqCst) {
                monitor.tick().await;
                let pid = home.record("t1").pid;
                if pid != 0 && !seen.contains(&pid) {
                    seen.push(pid);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let (res, ()) = tokio::join!(stop, ticks);
        res.unwrap();

        for _ in 0..3 {
            assert!(monitor.tick().await.restarted.is_empty());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let rec = home.record("t1");
        assert_eq!(rec.status, TaskStatus::Stopped);
        assert_eq!(rec.pid, 0);
        assert!(rec.stopped_by_operator);
        for pid in seen {
            let mut gone = false;
            for _ in 0..60 {
                if !liveness::is_alive(pid) {
                    gone = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(gone, "pid {pid} outlived the operator stop");
        }
        operator.shutdown().await;
        daemon.shutdown().await;
    }
}

#[tokio::test]
async fn second_invocation_sees_the_first_ones_process() {
    let home = Home::new();
    let first = home.invocation(Role::Command);
    first.add_task(sleeper("t1", false, 3)).unwrap();
    let started = first.start_task("t1").await.unwrap();
    first.shutdown().await;
    drop(first);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = home.invocation(Role::Command);
    let rows = second.list_tasks().await.unwrap();
    assert_eq!(rows[0].name, BUILTIN_TASK);
    let t1 = rows.iter().find(|r| r.name == "t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Running);
    assert_eq!(t1.pid, started.pid);

    // And it can stop what it did not spawn.
    second.stop_task("t1").await.unwrap();
    assert!(!liveness::is_alive(started.pid));
    assert!(home.record("t1").stopped_by_operator);
}

#[tokio::test]
async fn corrupt_state_file_falls_back_to_backup() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    cmd.add_task(sleeper("t1", false, 3)).unwrap();
    cmd.add_task(sleeper("t2", false, 3)).unwrap();
    let t1 = cmd.start_task("t1").await.unwrap();
    // The second write backs up the document that already holds t1.
    let t2 = cmd.start_task("t2").await.unwrap();
    cmd.shutdown().await;

    std::fs::write(home.services.store.path(), b"{\"tasks\": {\"t1\": ").unwrap();

    let next = home.invocation(Role::Command);
    let info = next.get_status("t1").unwrap();
    assert_eq!(info.status, TaskStatus::Running);
    assert_eq!(info.pid, t1.pid);

    next.stop_task("t1").await.unwrap();
    // t2's record was lost with the corrupt primary.
    assert_eq!(next.get_status("t2").unwrap().status, TaskStatus::Stopped);
    let _ = liveness::terminate(t2.pid, Duration::from_millis(200)).await;
    next.shutdown().await;
}

#[tokio::test]
async fn reserved_name_is_guarded_everywhere() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    assert!(matches!(
        cmd.add_task(TaskConfig::new(BUILTIN_TASK, "sleep 1")),
        Err(TaskError::Builtin { op: BuiltinOp::Add, .. })
    ));
    assert!(matches!(
        cmd.update_task(TaskConfig::new(BUILTIN_TASK, "sleep 1")),
        Err(TaskError::Builtin { op: BuiltinOp::Edit, .. })
    ));
    assert!(matches!(
        cmd.remove_task(BUILTIN_TASK).await,
        Err(TaskError::Builtin { op: BuiltinOp::Delete, .. })
    ));
    assert!(matches!(cmd.stop_task(BUILTIN_TASK).await, Err(TaskError::DaemonNotRunning)));

    let info = cmd.get_status(BUILTIN_TASK).unwrap();
    assert!(info.builtin);
    assert_eq!(info.status, TaskStatus::Stopped);
}

#[tokio::test]
async fn delete_removes_definition_record_and_process() {
    let home = Home::new();
    let cmd = home.invocation(Role::Command);
    cmd.add_task(sleeper("t1", true, 3)).unwrap();
    let started = cmd.start_task("t1").await.unwrap();
    cmd.remove_task("t1").await.unwrap();
    cmd.shutdown().await;

    assert!(!liveness::is_alive(started.pid));
    assert!(home.services.store.get("t1").unwrap().is_none());
    assert!(!home.services.paths.task_file("t1").exists());

    let next = home.invocation(Role::Command);
    assert!(matches!(next.get_status("t1"), Err(TaskError::NotFound(_))));
    let daemon = home.invocation(Role::Daemon);
    let mut monitor = TaskMonitor::new(daemon, Duration::from_secs(5));
    assert!(monitor.tick().await.is_quiet());
}
