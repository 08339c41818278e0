use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    #[default]
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Persisted status of one task (or of the daemon, under the builtin name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRuntimeRecord {
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    /// Set when an operator explicitly stopped the task; suppresses auto-restart.
    #[serde(default, rename = "stopped_by_taskd")]
    pub stopped_by_operator: bool,
    #[serde(default, rename = "retry_num")]
    pub retry_count: u32,
    /// Kernel start time of `pid` in clock ticks, used to detect pid reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_start: Option<u64>,
}

impl TaskRuntimeRecord {
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TaskStatus::Stopped,
            pid: 0,
            start_time: None,
            end_time: None,
            exit_code: 0,
            stopped_by_operator: false,
            retry_count: 0,
            proc_start: None,
        }
    }

    pub fn running(name: impl Into<String>, pid: u32, start_time: DateTime<Local>, proc_start: Option<u64>) -> Self {
        Self {
            status: TaskStatus::Running,
            pid,
            start_time: Some(start_time),
            proc_start,
            ..Self::stopped(name)
        }
    }

    /// Status says running and there is a pid to check. Whether the process still exists is
    /// a separate question for the liveness checker.
    pub fn claims_running(&self) -> bool {
        self.status == TaskStatus::Running && self.pid > 0
    }

    /// Transition to a non-running status, keeping retry count and operator flag.
    pub fn mark_ended(&mut self, status: TaskStatus, exit_code: i32, at: DateTime<Local>) {
        self.status = status;
        self.pid = 0;
        self.proc_start = None;
        self.exit_code = exit_code;
        self.end_time = Some(at);
    }
}

/// The shared `{ "tasks": { ... } }` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStateDocument {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRuntimeRecord>,
}

impl RuntimeStateDocument {
    pub fn get(&self, name: &str) -> Option<&TaskRuntimeRecord> {
        self.tasks.get(name)
    }

    pub fn upsert(&mut self, record: TaskRuntimeRecord) {
        self.tasks.insert(record.name.clone(), record);
    }

    /// Repair records that violate `running => pid > 0` and keys that disagree with names.
    fn sanitize(&mut self) {
        for (key, rec) in self.tasks.iter_mut() {
            if rec.name != *key {
                rec.name = key.clone();
            }
            if rec.status == TaskStatus::Running && rec.pid == 0 {
                tracing::warn!(target: "store", task = %key, "record claims running without pid; marking stopped");
                rec.status = TaskStatus::Stopped;
            }
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// File-backed store for [`RuntimeStateDocument`].
///
/// The only cross-process synchronization is the atomic rename of the state file, so every
/// mutation is a full read-modify-write of a freshly loaded document. The in-process mutex
/// serializes callers sharing this store instance.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    backup: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".bak");
        Self {
            path,
            backup: PathBuf::from(backup),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn load(&self) -> anyhow::Result<RuntimeStateDocument> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load_unlocked()
    }

    pub fn save(&self, doc: &RuntimeStateDocument) -> anyhow::Result<()> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.save_unlocked(doc)
    }

    /// Reload, apply `f`, write back. One read-modify-write cycle per call.
    pub fn update<T>(&self, f: impl FnOnce(&mut RuntimeStateDocument) -> T) -> anyhow::Result<T> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc = self.load_unlocked()?;
        let out = f(&mut doc);
        self.save_unlocked(&doc)?;
        Ok(out)
    }

    pub fn batch_update(&self, records: impl IntoIterator<Item = TaskRuntimeRecord>) -> anyhow::Result<()> {
        self.update(|doc| {
            for r in records {
                doc.upsert(r);
            }
        })
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Option<TaskRuntimeRecord>> {
        Ok(self.load()?.tasks.remove(name))
    }

    pub fn upsert(&self, record: TaskRuntimeRecord) -> anyhow::Result<()> {
        self.update(|doc| doc.upsert(record))
    }

    pub fn remove(&self, name: &str) -> anyhow::Result<bool> {
        self.update(|doc| doc.tasks.remove(name).is_some())
    }

    fn load_unlocked(&self) -> anyhow::Result<RuntimeStateDocument> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RuntimeStateDocument::default()),
            Err(e) => anyhow::bail!("failed to read state file {}: {e}", self.path.display()),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(RuntimeStateDocument::default());
        }
        match serde_json::from_slice::<RuntimeStateDocument>(&bytes) {
            Ok(mut doc) => {
                doc.sanitize();
                Ok(doc)
            }
            Err(e) => {
                tracing::warn!(target: "store", path = %self.path.display(), "state file unreadable: {e}");
                Ok(self.recover_unlocked())
            }
        }
    }

    fn recover_unlocked(&self) -> RuntimeStateDocument {
        match fs::read(&self.backup)
            .map_err(anyhow::Error::from)
            .and_then(|b| serde_json::from_slice::<RuntimeStateDocument>(&b).map_err(anyhow::Error::from))
        {
            Ok(mut doc) => {
                doc.sanitize();
                match self.write_primary(&doc) {
                    Ok(()) => tracing::warn!(target: "store", backup = %self.backup.display(), "restored state from backup"),
                    Err(e) => tracing::warn!(target: "store", "restored state from backup but rewrite failed: {e}"),
                }
                doc
            }
            Err(e) => {
                let stamp = Local::now().format("%Y%m%d_%H%M%S");
                let mut q = self.path.clone().into_os_string();
                q.push(format!(".corrupted.{stamp}"));
                let q = PathBuf::from(q);
                match fs::rename(&self.path, &q) {
                    Ok(()) => tracing::error!(
                        target: "store",
                        quarantined = %q.display(),
                        "state file and backup unusable ({e}); starting from an empty document"
                    ),
                    Err(re) => tracing::error!(target: "store", "failed to quarantine {}: {re}", self.path.display()),
                }
                RuntimeStateDocument::default()
            }
        }
    }

    fn save_unlocked(&self, doc: &RuntimeStateDocument) -> anyhow::Result<()> {
        // Only a parseable primary becomes the backup, so a corrupt file never evicts a good one.
        if let Ok(cur) = fs::read(&self.path) {
            if serde_json::from_slice::<RuntimeStateDocument>(&cur).is_ok() {
                if let Err(e) = fs::write(&self.backup, &cur) {
                    tracing::warn!(target: "store", backup = %self.backup.display(), "backup failed: {e}");
                }
            }
        }
        self.write_primary(doc)
    }

    fn write_primary(&self, doc: &RuntimeStateDocument) -> anyhow::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", parent.display()))?;

        let json = serde_json::to_vec_pretty(doc)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "runtime.json".to_string());
        let tmp = parent.join(format!(
            ".{file_name}.tmp.{}.{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let res = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
            // Atomic replace on POSIX.
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            anyhow::bail!("failed to write state file {}: {e}", self.path.display());
        }
        Ok(())
    }
}
