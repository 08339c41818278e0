use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HOME_ENV: &str = "TASKD_HOME";
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// On-disk layout under the taskd home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub home: PathBuf,
    pub tasks_dir: PathBuf,
    pub runtime_file: PathBuf,
    pub logs_dir: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            tasks_dir: home.join("tasks"),
            runtime_file: home.join("runtime.json"),
            logs_dir: home.join("logs"),
            home,
        }
    }

    /// `$TASKD_HOME`, else `~/.taskd`, else `./.taskd` when no home directory can be determined.
    pub fn discover() -> Self {
        if let Some(h) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(h));
        }
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(".taskd"))
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for d in [&self.home, &self.tasks_dir, &self.logs_dir] {
            std::fs::create_dir_all(d)
                .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", d.display()))?;
        }
        Ok(())
    }

    pub fn default_config_file(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }

    pub fn task_file(&self, name: &str) -> PathBuf {
        self.tasks_dir.join(format!("{name}.yaml"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Task monitor polling interval.
    pub monitor_interval: Duration,
    /// Time a process gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    pub log_level: String,
    /// Daemon log file. Relative paths are resolved against the home directory.
    pub log_file: PathBuf,
    /// When false, commands never spawn the monitor daemon on their own.
    pub daemon_autostart: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(default_monitor_interval_ms()),
            stop_grace: Duration::from_millis(default_stop_grace_ms()),
            log_level: default_log_level(),
            log_file: default_log_file(),
            daemon_autostart: true,
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    monitor: Option<MonitorConfigFile>,
    #[serde(default)]
    log: Option<LogConfigFile>,
    #[serde(default)]
    daemon: Option<DaemonConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    stop_grace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default = "default_log_file")]
    file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    #[serde(default = "default_true")]
    autostart: bool,
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs/taskd.log")
}

fn default_true() -> bool {
    true
}

/// Load global settings. A missing file yields defaults; a present but invalid file is an error.
pub fn load_settings(config_path: &Path, paths: &Paths) -> anyhow::Result<Settings> {
    let file_cfg: SettingsFile = match std::fs::read_to_string(config_path) {
        Ok(raw) if raw.trim().is_empty() => SettingsFile::default(),
        Ok(raw) => serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsFile::default(),
        Err(e) => anyhow::bail!("failed to read config {}: {e}", config_path.display()),
    };

    let mut cfg = Settings::default();

    if let Some(m) = file_cfg.monitor {
        if let Some(s) = m.interval {
            let ms = parse_duration_str(&s).map_err(|e| anyhow::anyhow!("monitor.interval: {e}"))?;
            anyhow::ensure!(ms > 0, "monitor.interval must be > 0");
            cfg.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(s) = m.stop_grace {
            let ms = parse_duration_str(&s).map_err(|e| anyhow::anyhow!("monitor.stop_grace: {e}"))?;
            cfg.stop_grace = Duration::from_millis(ms);
        }
    }
    if let Some(l) = file_cfg.log {
        let level = l.level.trim().to_ascii_lowercase();
        anyhow::ensure!(
            matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error"),
            "log.level must be one of trace/debug/info/warn/error (got {:?})",
            l.level
        );
        cfg.log_level = level;
        cfg.log_file = l.file;
    }
    if let Some(d) = file_cfg.daemon {
        cfg.daemon_autostart = d.autostart;
    }

    if cfg.log_file.is_relative() {
        cfg.log_file = paths.home.join(&cfg.log_file);
    }
    Ok(cfg)
}

/// Parse `1500ms`, `10s`, `1.5m`, `2h` into milliseconds.
pub fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

/// Inverse of [`parse_duration_str`] for display, picking the largest exact unit.
pub fn format_duration_ms(ms: u64) -> String {
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}
