use crate::td::asyncutil::TaskTracker;
use crate::td::config::format_duration_ms;
use crate::td::context::Services;
use crate::td::definition::{self, is_builtin, TaskConfig, BUILTIN_TASK};
use crate::td::error::{BuiltinOp, TaskError, TaskResult};
use crate::td::liveness::{self, ProcessIdentity};
use crate::td::restart;
use crate::td::stdio::IoInfo;
use crate::td::store::{StateStore, TaskRuntimeRecord, TaskStatus};
use crate::td::task::{ExitCallback, Task, TaskExit};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const RESTART_PAUSE: Duration = Duration::from_millis(100);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// Which kind of process hosts this manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// One-shot command invocation; may spawn the daemon.
    Command,
    /// The monitor daemon itself; never spawns another daemon.
    Daemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Operator request; clears the retry counter.
    Manual,
    /// Monitor restart; bumps the retry counter.
    AutoRestart,
}

/// Status row for `list` / `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub status: TaskStatus,
    pub pid: u32,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub executable: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub auto_start: bool,
    pub retry_num: u32,
    pub max_retry_num: u32,
    pub stopped_by_operator: bool,
    pub builtin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub info: TaskInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub workdir: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub inherit_env: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_delay: Option<String>,
    pub io: IoInfo,
}

/// Persist an observed exit, unless the record has moved on to another process meanwhile.
fn persist_exit(store: &StateStore, exit: &TaskExit) -> anyhow::Result<bool> {
    store.update(|doc| match doc.tasks.get_mut(&exit.name) {
        Some(r) if r.pid == exit.pid && r.status == TaskStatus::Running => {
            r.mark_ended(TaskStatus::Stopped, exit.exit_code, exit.at);
            true
        }
        _ => false,
    })
}

/// Record that `pid` was stopped by us. A record that already tracks another process is left alone.
fn persist_stopped(store: &StateStore, name: &str, pid: u32) -> anyhow::Result<bool> {
    store.update(|doc| match doc.tasks.get_mut(name) {
        Some(r) if r.pid == pid && r.status == TaskStatus::Running => {
            r.mark_ended(TaskStatus::Stopped, -1, Local::now());
            true
        }
        _ => false,
    })
}

fn exit_callback(store: Arc<StateStore>) -> ExitCallback {
    Arc::new(move |exit: TaskExit| {
        if let Err(e) = persist_exit(&store, &exit) {
            tracing::warn!(target: "manager", task = %exit.name, "failed to persist exit: {e:#}");
        }
    })
}

fn info_from(cfg: &TaskConfig, rec: Option<&TaskRuntimeRecord>, last_error: Option<String>) -> TaskInfo {
    let fallback = TaskRuntimeRecord::stopped(&cfg.name);
    let rec = rec.unwrap_or(&fallback);
    TaskInfo {
        name: cfg.name.clone(),
        status: rec.status,
        pid: rec.pid,
        start_time: rec.start_time,
        end_time: rec.end_time,
        executable: cfg.display_command(),
        exit_code: rec.exit_code,
        last_error,
        auto_start: cfg.auto_start,
        retry_num: rec.retry_count,
        max_retry_num: cfg.max_retry,
        stopped_by_operator: rec.stopped_by_operator,
        builtin: is_builtin(&cfg.name),
    }
}

/// Entry point for every task operation, in commands and in the daemon alike.
///
/// In-memory [`Task`]s only know about processes this OS process spawned or adopted; the state
/// file is the truth, and every operation reconciles against a fresh read of it.
pub struct Manager {
    services: Arc<Services>,
    role: Role,
    tracker: TaskTracker,
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("role", &self.role)
            .field("tasks", &self.task_names())
            .finish()
    }
}

impl Manager {
    /// Load definitions and re-attach to processes the state file says are running.
    pub fn load(services: Arc<Services>, role: Role) -> anyhow::Result<Arc<Self>> {
        services.paths.ensure_dirs()?;
        let defs = definition::load_all(&services.paths)?;
        let doc = services.store.load()?;

        let mgr = Arc::new(Self {
            services,
            role,
            tracker: TaskTracker::new(),
            tasks: RwLock::new(HashMap::new()),
        });
        for (name, cfg) in defs {
            let task = mgr.new_task(cfg);
            if let Some(rec) = doc.get(&name) {
                task.restore_runtime_state(rec);
            }
            mgr.tasks.write().unwrap_or_else(|p| p.into_inner()).insert(name, task);
        }
        tracing::debug!(target: "manager", role = ?role, tasks = mgr.task_names().len(), "manager loaded");
        Ok(mgr)
    }

    fn new_task(&self, cfg: TaskConfig) -> Arc<Task> {
        Task::new(cfg, self.tracker.clone(), Some(exit_callback(Arc::clone(&self.services.store))))
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn store(&self) -> &StateStore {
        &self.services.store
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub(crate) fn task_handle(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    fn task(&self, name: &str) -> TaskResult<Arc<Task>> {
        self.task_handle(name).ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub fn config(&self, name: &str) -> TaskResult<TaskConfig> {
        if is_builtin(name) {
            return Ok(self.builtin_config());
        }
        Ok(self.task(name)?.config())
    }

    fn builtin_config(&self) -> TaskConfig {
        let launch = self.services.daemon.launch();
        definition::builtin_config(&launch.program, &launch.workdir)
    }

    /// Whether the process a running record points at is still there. A child of ours that has
    /// exited but not yet been reaped counts as alive, so the reaper records its real status.
    pub(crate) fn record_alive(&self, name: &str, rec: &TaskRuntimeRecord) -> bool {
        match self.task_handle(name) {
            Some(t) if t.is_running() && t.snapshot().pid == rec.pid => t.check_alive(),
            _ => liveness::matches_identity(rec.pid, &ProcessIdentity::default().with_start_ticks(rec.proc_start)),
        }
    }

    /// Mark `rec`'s process as gone unless the record moved on meanwhile. Returns the current record.
    pub(crate) fn mark_gone(&self, name: &str, rec: &TaskRuntimeRecord) -> anyhow::Result<Option<TaskRuntimeRecord>> {
        let exit_code = self
            .task_handle(name)
            .and_then(|t| t.last_exit())
            .filter(|x| x.pid == rec.pid)
            .map(|x| x.exit_code)
            .unwrap_or(0);
        let pid = rec.pid;
        self.store().update(|doc| {
            let cur = doc.tasks.get_mut(name)?;
            if cur.pid == pid && cur.status == TaskStatus::Running {
                cur.mark_ended(TaskStatus::Stopped, exit_code, Local::now());
            }
            Some(cur.clone())
        })
    }

    /// A record is only reported as running while its process exists; stale ones are healed.
    fn settle(&self, name: &str, rec: Option<TaskRuntimeRecord>) -> Option<TaskRuntimeRecord> {
        let rec = rec?;
        if !rec.claims_running() || self.record_alive(name, &rec) {
            return Some(rec);
        }
        match self.mark_gone(name, &rec) {
            Ok(cur) => {
                tracing::info!(target: "manager", task = %name, pid = rec.pid, "recorded process is gone");
                cur
            }
            Err(e) => {
                tracing::warn!(target: "manager", task = %name, "cannot persist exit of pid {}: {e:#}", rec.pid);
                let mut masked = rec;
                masked.mark_ended(TaskStatus::Stopped, 0, Local::now());
                Some(masked)
            }
        }
    }

    /// Stop a process `launch` spawned but must not keep, off the caller's path.
    fn discard(&self, task: &Arc<Task>, pid: u32) {
        let grace = self.services.settings.stop_grace;
        let task = Arc::clone(task);
        let store = Arc::clone(&self.services.store);
        self.tracker.spawn(async move {
            let _ = task.stop(grace).await;
            if let Err(e) = persist_stopped(&store, &task.name(), pid) {
                tracing::warn!(target: "manager", task = %task.name(), pid, "failed to persist stop: {e:#}");
            }
        });
    }

    /// Bring the in-memory task in line with the persisted record.
    fn reconcile(&self, task: &Arc<Task>, rec: Option<&TaskRuntimeRecord>) {
        if task.is_running() {
            task.check_alive();
        } else if let Some(rec) = rec {
            task.restore_runtime_state(rec);
        }
    }

    // ---------------- definition CRUD ----------------

    pub fn add_task(&self, cfg: TaskConfig) -> TaskResult<()> {
        if is_builtin(&cfg.name) {
            return Err(TaskError::Builtin {
                name: cfg.name,
                op: BuiltinOp::Add,
            });
        }
        cfg.validate()?;
        let name = cfg.name.clone();
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        if tasks.contains_key(&name) || self.services.paths.task_file(&name).exists() {
            return Err(TaskError::AlreadyExists(name));
        }
        definition::save_task_config(&self.services.paths, &cfg)?;
        tasks.insert(name.clone(), self.new_task(cfg));
        tracing::info!(target: "manager", task = %name, "task added");
        Ok(())
    }

    /// Replace a definition. A running process keeps its old settings until restarted.
    pub fn update_task(&self, cfg: TaskConfig) -> TaskResult<()> {
        if is_builtin(&cfg.name) {
            return Err(TaskError::Builtin {
                name: cfg.name,
                op: BuiltinOp::Edit,
            });
        }
        let task = self.task(&cfg.name)?;
        cfg.validate()?;
        definition::save_task_config(&self.services.paths, &cfg)?;
        tracing::info!(target: "manager", task = %cfg.name, "task updated");
        task.set_config(cfg);
        Ok(())
    }

    /// Re-read one definition file.
    pub fn reload_task(&self, name: &str) -> TaskResult<()> {
        if is_builtin(name) {
            return Err(TaskError::Builtin {
                name: name.to_string(),
                op: BuiltinOp::Edit,
            });
        }
        let path = self.services.paths.task_file(name);
        if !path.exists() {
            return Err(TaskError::NotFound(name.to_string()));
        }
        let cfg = definition::load_task_config(&path)?;
        cfg.validate()?;
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        match tasks.get(name) {
            Some(t) => t.set_config(cfg),
            None => {
                tasks.insert(name.to_string(), self.new_task(cfg));
            }
        }
        Ok(())
    }

    /// Stop if running, then delete the definition and the runtime record.
    pub async fn remove_task(&self, name: &str) -> TaskResult<()> {
        if is_builtin(name) {
            return Err(TaskError::Builtin {
                name: name.to_string(),
                op: BuiltinOp::Delete,
            });
        }
        let task = self.task(name)?;
        let rec = self.store().get(name)?;
        self.reconcile(&task, rec.as_ref());
        if task.is_running() {
            match task.stop(self.services.settings.stop_grace).await {
                Ok(()) | Err(TaskError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        definition::delete_task_config(&self.services.paths, name)?;
        self.store().remove(name)?;
        self.tasks.write().unwrap_or_else(|p| p.into_inner()).remove(name);
        tracing::info!(target: "manager", task = %name, "task removed");
        self.ensure_daemon_if_needed().await;
        Ok(())
    }

    /// Re-read the tasks directory so definitions added or removed by other processes show up.
    pub fn refresh_definitions(&self) -> anyhow::Result<BTreeMap<String, TaskConfig>> {
        let defs = definition::load_all(&self.services.paths)?;
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        for (name, cfg) in &defs {
            match tasks.get(name) {
                Some(t) => {
                    if t.config() != *cfg {
                        t.set_config(cfg.clone());
                    }
                }
                None => {
                    tasks.insert(name.clone(), self.new_task(cfg.clone()));
                }
            }
        }
        tasks.retain(|name, t| defs.contains_key(name) || t.is_running());
        Ok(defs)
    }

    // ---------------- lifecycle ----------------

    pub async fn start_task(&self, name: &str) -> TaskResult<TaskInfo> {
        if is_builtin(name) {
            self.services.daemon.start_daemon().await?;
            return Ok(self.daemon_info());
        }
        self.launch(name, StartKind::Manual)?;
        self.ensure_daemon_if_needed().await;
        self.get_status(name)
    }

    /// Spawn and persist in one step. Manual starts reset `retry_num`; monitor restarts
    /// increment it. A failed attempt is persisted with exit code -1 and the retry count kept.
    ///
    /// A monitor restart never overrides an operator stop, including one persisted while the
    /// process was being spawned.
    pub(crate) fn launch(&self, name: &str, kind: StartKind) -> TaskResult<TaskRuntimeRecord> {
        let task = self.task(name)?;
        let rec = self.store().get(name)?;
        if kind == StartKind::AutoRestart && rec.as_ref().is_some_and(|r| r.stopped_by_operator) {
            return Err(TaskError::StoppedByOperator(name.to_string()));
        }
        self.reconcile(&task, rec.as_ref());

        match task.start() {
            Ok(running) => {
                let pid = running.pid;
                let persisted = self.store().update(|doc| {
                    let prev = doc.get(name);
                    let vetoed = kind == StartKind::AutoRestart && prev.is_some_and(|r| r.stopped_by_operator);
                    let mut r = running;
                    r.retry_count = match kind {
                        StartKind::Manual => 0,
                        StartKind::AutoRestart => prev.map(|p| p.retry_count).unwrap_or(0).saturating_add(1),
                    };
                    r.stopped_by_operator = vetoed;
                    // A process that died before this write had its exit callback find nothing to update.
                    if let Some(exit) = task.last_exit().filter(|x| x.pid == r.pid) {
                        r.mark_ended(TaskStatus::Stopped, exit.exit_code, exit.at);
                    }
                    doc.upsert(r.clone());
                    (r, vetoed)
                });
                match persisted {
                    Ok((r, false)) => Ok(r),
                    Ok((_, true)) => {
                        tracing::info!(target: "manager", task = %name, pid, "operator stop arrived during restart; stopping again");
                        self.discard(&task, pid);
                        Err(TaskError::StoppedByOperator(name.to_string()))
                    }
                    Err(e) => {
                        // An unrecorded process would be invisible to every other invocation.
                        self.discard(&task, pid);
                        Err(TaskError::Other(e.context("task started but its state could not be saved; stopping it")))
                    }
                }
            }
            Err(TaskError::AlreadyRunning(n)) => Err(TaskError::AlreadyRunning(n)),
            Err(e) => {
                let status = match kind {
                    StartKind::Manual => TaskStatus::Failed,
                    StartKind::AutoRestart => TaskStatus::Stopped,
                };
                let res = self.store().update(|doc| {
                    let mut r = doc
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| TaskRuntimeRecord::stopped(name));
                    r.mark_ended(status, -1, Local::now());
                    if kind == StartKind::Manual {
                        r.stopped_by_operator = false;
                    }
                    doc.upsert(r);
                });
                if let Err(pe) = res {
                    tracing::warn!(target: "manager", task = %name, "failed to persist start failure: {pe:#}");
                }
                Err(e)
            }
        }
    }

    /// Always leaves the record stopped and flagged as operator-stopped, even when the
    /// process was already gone or could not be signalled.
    ///
    /// The flag is persisted before the signal goes out, so whichever process observes the
    /// exit records an operator stop and the monitor never sees a crash.
    pub async fn stop_task(&self, name: &str) -> TaskResult<()> {
        if is_builtin(name) {
            return self.services.daemon.stop_daemon().await;
        }
        let task = self.task(name)?;
        let rec = self.store().get(name)?;
        self.reconcile(&task, rec.as_ref());
        let pid = task.snapshot().pid;

        self.store().update(|doc| {
            let mut r = doc
                .get(name)
                .cloned()
                .unwrap_or_else(|| TaskRuntimeRecord::stopped(name));
            r.stopped_by_operator = true;
            doc.upsert(r);
        })?;

        let res = task.stop(self.services.settings.stop_grace).await;
        let was_running = !matches!(res, Err(TaskError::NotRunning(_)));
        self.store().update(|doc| {
            let mut r = doc
                .get(name)
                .cloned()
                .unwrap_or_else(|| TaskRuntimeRecord::stopped(name));
            if r.status == TaskStatus::Running {
                // Someone else started a new process meanwhile; that one is theirs.
                let identity = ProcessIdentity::default().with_start_ticks(r.proc_start);
                if r.pid != pid && liveness::matches_identity(r.pid, &identity) {
                    return;
                }
                r.mark_ended(TaskStatus::Stopped, -1, Local::now());
            } else {
                r.status = TaskStatus::Stopped;
                r.pid = 0;
                r.proc_start = None;
            }
            r.stopped_by_operator = true;
            doc.upsert(r);
        })?;
        if was_running {
            tracing::info!(target: "manager", task = %name, "stopped by operator");
        }
        self.ensure_daemon_if_needed().await;
        res
    }

    pub async fn restart_task(&self, name: &str) -> TaskResult<TaskInfo> {
        if is_builtin(name) {
            if let Err(e) = self.services.daemon.stop_daemon().await {
                if !e.is_state_conflict() {
                    tracing::warn!(target: "daemon", "stopping daemon before restart failed: {e}");
                }
            }
            self.services.daemon.start_daemon().await?;
            return Ok(self.daemon_info());
        }
        let task = self.task(name)?;
        let rec = self.store().get(name)?;
        self.reconcile(&task, rec.as_ref());
        if task.is_running() {
            match task.stop(self.services.settings.stop_grace).await {
                Ok(()) | Err(TaskError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(RESTART_PAUSE).await;
        }
        self.launch(name, StartKind::Manual)?;
        self.ensure_daemon_if_needed().await;
        self.get_status(name)
    }

    // ---------------- queries ----------------

    pub fn get_status(&self, name: &str) -> TaskResult<TaskInfo> {
        if is_builtin(name) {
            return Ok(self.daemon_info());
        }
        let task = self.task(name)?;
        let rec = self.store().get(name)?;
        self.reconcile(&task, rec.as_ref());
        // Reconciling may have persisted an exit; read again.
        let rec = self.settle(name, self.store().get(name)?);
        Ok(info_from(&task.config(), rec.as_ref(), task.snapshot().last_error))
    }

    pub fn get_detail(&self, name: &str) -> TaskResult<TaskDetail> {
        let info = self.get_status(name)?;
        let cfg = self.config(name)?;
        Ok(TaskDetail {
            info,
            display_name: cfg.display_name.clone(),
            description: cfg.description.clone(),
            workdir: cfg.resolved_workdir(),
            args: cfg.command_line().map(|(_, a)| a).unwrap_or_default(),
            env: cfg.env.clone(),
            inherit_env: cfg.inherit_env,
            restart_delay: cfg.restart_delay.map(|d| format_duration_ms(d.as_millis() as u64)),
            io: cfg.io_info(),
        })
    }

    /// The daemon row first, then tasks by name, as persisted.
    pub async fn list_tasks(&self) -> TaskResult<Vec<TaskInfo>> {
        self.ensure_daemon_if_needed().await;
        let doc = self.store().load()?;
        let mut out = vec![self.daemon_info()];
        for name in self.task_names() {
            let Some(task) = self.task_handle(&name) else {
                continue;
            };
            let rec = self.settle(&name, doc.get(&name).cloned());
            out.push(info_from(&task.config(), rec.as_ref(), task.snapshot().last_error));
        }
        Ok(out)
    }

    pub fn daemon_info(&self) -> TaskInfo {
        let cfg = self.builtin_config();
        let daemon = &self.services.daemon;
        let rec = daemon.record().unwrap_or_else(|e| {
            tracing::warn!(target: "daemon", "cannot read daemon record: {e:#}");
            None
        });
        let mut info = info_from(&cfg, rec.as_ref(), None);
        if let Some(rec) = &rec {
            if rec.claims_running() && !daemon.validate(rec) {
                info.status = TaskStatus::Stopped;
                info.pid = 0;
                info.last_error = Some(format!("recorded pid {} is not a running daemon", rec.pid));
            }
        }
        info
    }

    // ---------------- daemon coordination ----------------

    /// Something is running, or some auto-start task may still need a (re)start.
    pub fn needs_daemon(&self) -> bool {
        let doc = match self.store().load() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(target: "manager", "cannot read state: {e:#}");
                return false;
            }
        };
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let orphan_running = doc
            .tasks
            .values()
            .any(|r| !is_builtin(&r.name) && !tasks.contains_key(&r.name) && r.claims_running());
        orphan_running
            || tasks
                .iter()
                .any(|(name, t)| restart::needs_monitoring(&t.config(), doc.get(name)))
    }

    /// Daemon trouble is logged, never returned: task operations work without monitoring.
    pub async fn ensure_daemon_if_needed(&self) {
        if self.role == Role::Daemon || !self.services.settings.daemon_autostart {
            return;
        }
        if !self.needs_daemon() {
            return;
        }
        match self.services.daemon.ensure_running().await {
            Ok(true) => tracing::info!(target: "daemon", "started monitor daemon"),
            Ok(false) => {}
            Err(e) => tracing::warn!(target: "daemon", "could not start monitor daemon: {e}"),
        }
    }

    /// Stop reapers and watchers. Processes keep running and are re-adopted later.
    pub async fn shutdown(&self) {
        if !self.tracker.shutdown(SHUTDOWN_WAIT).await {
            tracing::debug!(target: "manager", active = self.tracker.active_count(), "workers still winding down");
        }
    }
}
