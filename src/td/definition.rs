use crate::td::config::{format_duration_ms, parse_duration_str, Paths};
use crate::td::error::{TaskError, TaskResult};
use crate::td::stdio::IoInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reserved name of the monitor daemon inside the task namespace.
pub const BUILTIN_TASK: &str = "taskd";

/// Flag that makes the executable enter the monitor loop instead of command dispatch.
pub const DAEMON_FLAG: &str = "--daemon";

const MAX_NAME_LEN: usize = 50;
const DEFAULT_MAX_RETRY: i64 = 3;

pub fn is_builtin(name: &str) -> bool {
    name == BUILTIN_TASK
}

/// A task as loaded from `tasks/<name>.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Program, or a whole shell-quoted command line when `args` is empty.
    pub executable: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// `KEY=VALUE` entries; they win over inherited variables.
    pub env: Vec<String>,
    pub inherit_env: bool,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub auto_start: bool,
    /// 0 means unlimited.
    pub max_retry: u32,
    /// Minimum time between an exit and the automatic restart that follows it.
    pub restart_delay: Option<Duration>,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: None,
            executable: executable.into(),
            args: vec![],
            workdir: None,
            env: vec![],
            inherit_env: true,
            stdin: None,
            stdout: None,
            stderr: None,
            auto_start: false,
            max_retry: DEFAULT_MAX_RETRY as u32,
            restart_delay: None,
        }
    }

    /// Program and argv. With no explicit args, `executable` is split with shell quoting rules.
    pub fn command_line(&self) -> TaskResult<(String, Vec<String>)> {
        if !self.args.is_empty() {
            return Ok((self.executable.trim().to_string(), self.args.clone()));
        }
        let mut words = shlex::split(&self.executable)
            .ok_or_else(|| TaskError::invalid(&self.name, "executable has unbalanced quotes"))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| TaskError::invalid(&self.name, "executable is empty"))?;
        Ok((program, words.collect()))
    }

    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            return self.executable.clone();
        }
        let mut parts = vec![self.executable.clone()];
        parts.extend(self.args.iter().map(|a| shlex::try_quote(a).map(|q| q.into_owned()).unwrap_or_else(|_| a.clone())));
        parts.join(" ")
    }

    /// Configured workdir, else the user's home directory.
    pub fn resolved_workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn io_info(&self) -> IoInfo {
        IoInfo::resolve(
            self.stdin.as_deref(),
            self.stdout.as_deref(),
            self.stderr.as_deref(),
            &self.resolved_workdir(),
        )
    }

    /// Checks that must pass before the definition is written or used.
    pub fn validate(&self) -> TaskResult<()> {
        validate_name(&self.name)?;
        let bad = |reason: String| Err(TaskError::invalid(&self.name, reason));
        if self.executable.trim().is_empty() {
            return bad("executable must not be empty".to_string());
        }
        self.command_line()?;
        for kv in &self.env {
            match kv.split_once('=') {
                Some((k, _)) if !k.trim().is_empty() && !k.contains(char::is_whitespace) => {}
                _ => return bad(format!("environment entry {kv:?} must look like KEY=VALUE")),
            }
        }
        if let Some(w) = &self.workdir {
            if !w.is_dir() {
                return bad(format!("working directory {} does not exist", w.display()));
            }
        }
        let io = self.io_info();
        if let Some(stdin) = &io.stdin_path {
            if Some(stdin) == io.stdout_path.as_ref() || Some(stdin) == io.stderr_path.as_ref() {
                return bad(format!("stdin {} is also used for output", stdin.display()));
            }
        }
        Ok(())
    }
}

pub fn validate_name(name: &str) -> TaskResult<()> {
    if name.is_empty() {
        return Err(TaskError::invalid(name, "task name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TaskError::invalid(
            name,
            format!("task name must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(TaskError::invalid(
            name,
            "task name may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// The synthetic definition standing in for the daemon.
pub fn builtin_config(executable: &Path, workdir: &Path) -> TaskConfig {
    TaskConfig {
        display_name: Some("taskd monitor daemon".to_string()),
        description: Some("Polls task liveness and restarts auto-start tasks".to_string()),
        args: vec![DAEMON_FLAG.to_string()],
        workdir: Some(workdir.to_path_buf()),
        max_retry: 0,
        ..TaskConfig::new(BUILTIN_TASK, executable.display().to_string())
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    executable: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<String>,
    #[serde(default = "default_true")]
    inherit_env: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(default)]
    auto_start: bool,
    #[serde(default = "default_max_retry")]
    max_retry_num: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restart: Option<RestartConfigFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestartConfigFile {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration_ms",
        serialize_with = "serialize_opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    delay: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_max_retry() -> i64 {
    DEFAULT_MAX_RETRY
}

fn deserialize_opt_duration_ms<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("delay must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom("delay must be integer milliseconds or a string like \"5s\"")),
    }
}

fn serialize_opt_duration_ms<S>(v: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match v {
        Some(ms) => serializer.serialize_str(&format_duration_ms(*ms)),
        None => serializer.serialize_none(),
    }
}

impl TaskConfigFile {
    fn into_definition(self, source_file: &Path) -> anyhow::Result<TaskConfig> {
        let stem = source_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = match self.name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => stem.clone(),
        };
        anyhow::ensure!(
            name == stem,
            "task name {name:?} does not match file name {}",
            source_file.display()
        );
        let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(TaskConfig {
            name,
            display_name: clean(self.display_name),
            description: clean(self.description),
            executable: self.executable,
            args: self.args,
            workdir: self.workdir.filter(|p| !p.as_os_str().is_empty()),
            env: self.env,
            inherit_env: self.inherit_env,
            stdin: clean(self.stdin),
            stdout: clean(self.stdout),
            stderr: clean(self.stderr),
            auto_start: self.auto_start,
            max_retry: u32::try_from(self.max_retry_num.max(0)).unwrap_or(u32::MAX),
            restart_delay: self
                .restart
                .and_then(|r| r.delay)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        })
    }

    fn from_definition(cfg: &TaskConfig) -> Self {
        Self {
            name: Some(cfg.name.clone()),
            display_name: cfg.display_name.clone(),
            description: cfg.description.clone(),
            executable: cfg.executable.clone(),
            args: cfg.args.clone(),
            workdir: cfg.workdir.clone(),
            env: cfg.env.clone(),
            inherit_env: cfg.inherit_env,
            stdin: cfg.stdin.clone(),
            stdout: cfg.stdout.clone(),
            stderr: cfg.stderr.clone(),
            auto_start: cfg.auto_start,
            max_retry_num: i64::from(cfg.max_retry),
            restart: cfg.restart_delay.map(|d| RestartConfigFile {
                delay: Some(d.as_millis() as u64),
            }),
        }
    }
}

pub fn parse_task_yaml(raw: &str, source_file: &Path) -> anyhow::Result<TaskConfig> {
    let file: TaskConfigFile = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse task definition {}: {e}", source_file.display()))?;
    file.into_definition(source_file)
}

pub fn render_task_yaml(cfg: &TaskConfig) -> anyhow::Result<String> {
    Ok(serde_yaml::to_string(&TaskConfigFile::from_definition(cfg))?)
}

pub fn load_task_config(path: &Path) -> anyhow::Result<TaskConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read task definition {}: {e}", path.display()))?;
    parse_task_yaml(&raw, path)
}

/// Every `*.yaml` under the tasks directory. Unreadable files are logged and skipped.
pub fn load_all(paths: &Paths) -> anyhow::Result<BTreeMap<String, TaskConfig>> {
    let mut out = BTreeMap::new();
    let rd = match std::fs::read_dir(&paths.tasks_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => anyhow::bail!("failed to list {}: {e}", paths.tasks_dir.display()),
    };
    for entry in rd {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match load_task_config(&path) {
            Ok(cfg) if is_builtin(&cfg.name) => {
                tracing::warn!(target: "manager", file = %path.display(), "ignoring definition that uses the reserved name");
            }
            Ok(cfg) => {
                out.insert(cfg.name.clone(), cfg);
            }
            Err(e) => tracing::warn!(target: "manager", file = %path.display(), "skipping task definition: {e:#}"),
        }
    }
    Ok(out)
}

/// Write `tasks/<name>.yaml` via temp file + rename.
pub fn save_task_config(paths: &Paths, cfg: &TaskConfig) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&paths.tasks_dir)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", paths.tasks_dir.display()))?;
    let path = paths.task_file(&cfg.name);
    let tmp = paths
        .tasks_dir
        .join(format!(".{}.yaml.tmp.{}", cfg.name, std::process::id()));
    std::fs::write(&tmp, render_task_yaml(cfg)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn delete_task_config(paths: &Paths, name: &str) -> anyhow::Result<bool> {
    match std::fs::remove_file(paths.task_file(name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow::anyhow!("failed to delete definition of {name}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_definition() {
        let raw = r#"
name: web
display_name: Web
executable: "python3 -m http.server 8080"
workdir: /tmp
env: ["PORT=8080", "MODE=dev"]
inherit_env: false
stdout: logs/out.log
stderr: logs/out.log
auto_start: true
max_retry_num: 5
restart:
  delay: 2s
"#;
        let cfg = parse_task_yaml(raw, Path::new("/h/tasks/web.yaml")).unwrap();
        assert_eq!(cfg.name, "web");
        assert!(cfg.auto_start);
        assert!(!cfg.inherit_env);
        assert_eq!(cfg.max_retry, 5);
        assert_eq!(cfg.restart_delay, Some(Duration::from_secs(2)));
        assert_eq!(
            cfg.command_line().unwrap(),
            ("python3".to_string(), vec!["-m".to_string(), "http.server".to_string(), "8080".to_string()])
        );
        assert!(cfg.io_info().same_output);
        assert_eq!(cfg.env_pairs()[0], ("PORT".to_string(), "8080".to_string()));
    }

    #[test]
    fn defaults_and_name_from_file() {
        let cfg = parse_task_yaml("executable: sleep\nargs: [\"100\"]\n", Path::new("t1.yaml")).unwrap();
        assert_eq!(cfg.name, "t1");
        assert!(cfg.inherit_env);
        assert!(!cfg.auto_start);
        assert_eq!(cfg.max_retry, 3);
        assert_eq!(cfg.command_line().unwrap(), ("sleep".to_string(), vec!["100".to_string()]));
    }

    #[test]
    fn negative_retry_means_unlimited() {
        let cfg = parse_task_yaml("executable: x\nmax_retry_num: -1\n", Path::new("t.yaml")).unwrap();
        assert_eq!(cfg.max_retry, 0);
    }

    #[test]
    fn rejects_unknown_keys_and_mismatched_name() {
        assert!(parse_task_yaml("executable: x\nbogus: 1\n", Path::new("t.yaml")).is_err());
        assert!(parse_task_yaml("name: other\nexecutable: x\n", Path::new("t.yaml")).is_err());
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("web-1_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dots.no").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn validation_catches_bad_fields() {
        let mut cfg = TaskConfig::new("t", "   ");
        assert!(matches!(cfg.validate(), Err(TaskError::InvalidConfig { .. })));

        cfg.executable = "echo 'unterminated".to_string();
        assert!(cfg.validate().is_err());

        cfg.executable = "echo".to_string();
        cfg.env = vec!["NOEQUALS".to_string()];
        assert!(cfg.validate().is_err());

        cfg.env = vec!["A=1".to_string()];
        cfg.workdir = Some(PathBuf::from("/definitely/missing/dir"));
        assert!(cfg.validate().is_err());

        cfg.workdir = Some(PathBuf::from("/tmp"));
        cfg.stdin = Some("io.txt".to_string());
        cfg.stdout = Some("/tmp/io.txt".to_string());
        assert!(cfg.validate().is_err());

        cfg.stdout = None;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut cfg = TaskConfig::new("job", "sleep");
        cfg.args = vec!["5".to_string()];
        cfg.auto_start = true;
        cfg.restart_delay = Some(Duration::from_millis(1500));
        let path = save_task_config(&paths, &cfg).unwrap();
        assert_eq!(path, paths.task_file("job"));
        assert_eq!(load_task_config(&path).unwrap(), cfg);

        std::fs::write(paths.tasks_dir.join("broken.yaml"), "::: not yaml").unwrap();
        std::fs::write(paths.tasks_dir.join("notes.txt"), "ignored").unwrap();
        let all = load_all(&paths).unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["job"]);

        assert!(delete_task_config(&paths, "job").unwrap());
        assert!(!delete_task_config(&paths, "job").unwrap());
    }

    #[test]
    fn builtin_definition_reinvokes_with_daemon_flag() {
        let cfg = builtin_config(Path::new("/usr/local/bin/taskd"), Path::new("/h"));
        assert!(is_builtin(&cfg.name));
        assert_eq!(
            cfg.command_line().unwrap(),
            ("/usr/local/bin/taskd".to_string(), vec![DAEMON_FLAG.to_string()])
        );
        assert!(!cfg.auto_start);
    }
}
