use crate::td::config::{self, parse_duration_str, Paths};
use crate::td::context::Services;
use crate::td::definition::TaskConfig;
use crate::td::logging::{self, LogMode};
use crate::td::manager::{Manager, Role, TaskDetail, TaskInfo};
use crate::td::store::TaskStatus;
use crate::td::{build_info, monitor};
use chrono::{DateTime, Local};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "taskd", version, about = "user-level process supervisor")]
pub struct Args {
    /// Path to the global config YAML (default: <home>/config.yaml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Run the monitor loop (used when taskd spawns its own daemon)
    #[arg(long = "daemon", hide = true)]
    pub daemon: bool,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Define a new task
    Add {
        name: String,
        /// Program, or a full command line when no --arg is given
        #[arg(short = 'e', long = "exec")]
        executable: String,
        #[command(flatten)]
        opts: DefinitionArgs,
    },
    /// Change an existing task definition (takes effect on next start)
    Edit {
        name: String,
        #[arg(short = 'e', long = "exec")]
        executable: Option<String>,
        /// Drop all configured environment entries before applying -E
        #[arg(long = "clear-env")]
        clear_env: bool,
        #[command(flatten)]
        opts: DefinitionArgs,
    },
    /// Stop a task and delete its definition and runtime record
    #[command(alias = "rm")]
    Del { name: String },
    /// Show all tasks (the daemon first)
    #[command(alias = "ls")]
    List {
        #[arg(short = 'r', long = "running", conflicts_with = "stopped")]
        running: bool,
        #[arg(short = 's', long = "stopped")]
        stopped: bool,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    /// Show one task in detail
    Info {
        name: String,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Print version and build info
    Version,
}

#[derive(Debug, Default, clap::Args)]
pub struct DefinitionArgs {
    /// Argument (repeatable); disables shell-splitting of the executable
    #[arg(short = 'a', long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
    #[arg(short = 'w', long = "workdir")]
    pub workdir: Option<PathBuf>,
    /// KEY=VALUE (repeatable)
    #[arg(short = 'E', long = "env")]
    pub env: Vec<String>,
    #[arg(long = "no-inherit-env", conflicts_with = "inherit_env")]
    pub no_inherit_env: bool,
    #[arg(long = "inherit-env")]
    pub inherit_env: bool,
    #[arg(long = "stdin")]
    pub stdin: Option<String>,
    #[arg(long = "stdout")]
    pub stdout: Option<String>,
    #[arg(long = "stderr")]
    pub stderr: Option<String>,
    #[arg(long = "auto-start", conflicts_with = "no_auto_start")]
    pub auto_start: bool,
    #[arg(long = "no-auto-start")]
    pub no_auto_start: bool,
    /// 0 means unlimited
    #[arg(long = "max-retry")]
    pub max_retry: Option<u32>,
    /// e.g. 500ms, 10s, 1m; 0 disables
    #[arg(long = "restart-delay")]
    pub restart_delay: Option<String>,
    #[arg(long = "display-name")]
    pub display_name: Option<String>,
    #[arg(long = "description")]
    pub description: Option<String>,
}

impl DefinitionArgs {
    /// Overlay the given flags onto `cfg`. Unset flags leave fields alone.
    pub fn apply(self, cfg: &mut TaskConfig) -> anyhow::Result<()> {
        if !self.args.is_empty() {
            cfg.args = self.args;
        }
        if let Some(w) = self.workdir {
            cfg.workdir = Some(w);
        }
        for kv in self.env {
            let key = kv.split_once('=').map(|(k, _)| k.to_string());
            if let Some(key) = key {
                cfg.env.retain(|e| e.split_once('=').map(|(k, _)| k) != Some(key.as_str()));
            }
            cfg.env.push(kv);
        }
        if self.no_inherit_env {
            cfg.inherit_env = false;
        }
        if self.inherit_env {
            cfg.inherit_env = true;
        }
        let or_clear = |v: String| (!v.trim().is_empty()).then_some(v);
        if let Some(p) = self.stdin {
            cfg.stdin = or_clear(p);
        }
        if let Some(p) = self.stdout {
            cfg.stdout = or_clear(p);
        }
        if let Some(p) = self.stderr {
            cfg.stderr = or_clear(p);
        }
        if self.auto_start {
            cfg.auto_start = true;
        }
        if self.no_auto_start {
            cfg.auto_start = false;
        }
        if let Some(n) = self.max_retry {
            cfg.max_retry = n;
        }
        if let Some(d) = self.restart_delay {
            let ms = parse_duration_str(&d).map_err(|e| anyhow::anyhow!("invalid --restart-delay: {e}"))?;
            cfg.restart_delay = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(v) = self.display_name {
            cfg.display_name = or_clear(v);
        }
        if let Some(v) = self.description {
            cfg.description = or_clear(v);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub async fn run() -> anyhow::Result<()> {
    run_with(Args::parse()).await
}

pub async fn run_with(args: Args) -> anyhow::Result<()> {
    let paths = Paths::discover();
    let config_path = args.config.clone().unwrap_or_else(|| paths.default_config_file());
    let settings = config::load_settings(&config_path, &paths)?;

    if args.daemon {
        anyhow::ensure!(args.cmd.is_none(), "--daemon cannot be combined with a command");
        paths.ensure_dirs()?;
        logging::init(LogMode::Daemon, &settings)?;
        let services = Services::new(paths, settings)?;
        return monitor::run_daemon(services).await;
    }

    logging::init(LogMode::Command { verbose: args.verbose }, &settings)?;
    let Some(cmd) = args.cmd else {
        Args::command().print_help()?;
        println!();
        return Ok(());
    };
    if let Cmd::Version = cmd {
        println!("{}", build_info::banner());
        return Ok(());
    }

    let services = Services::new(paths, settings)?;
    let manager = Manager::load(services, Role::Command)?;
    let res = dispatch(&manager, cmd).await;
    manager.shutdown().await;
    res
}

async fn dispatch(manager: &Arc<Manager>, cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Add { name, executable, opts } => {
            let mut cfg = TaskConfig::new(&name, executable);
            opts.apply(&mut cfg)?;
            manager.add_task(cfg)?;
            manager.ensure_daemon_if_needed().await;
            println!("added {name}");
        }
        Cmd::Edit {
            name,
            executable,
            clear_env,
            opts,
        } => {
            let mut cfg = manager.config(&name)?;
            if let Some(e) = executable {
                cfg.executable = e;
            }
            if clear_env {
                cfg.env.clear();
            }
            opts.apply(&mut cfg)?;
            manager.update_task(cfg)?;
            manager.ensure_daemon_if_needed().await;
            println!("updated {name}");
            if manager.get_status(&name)?.status == TaskStatus::Running {
                println!("{name} is running; restart it to apply the change");
            }
        }
        Cmd::Del { name } => {
            manager.remove_task(&name).await?;
            println!("deleted {name}");
        }
        Cmd::List {
            running,
            stopped,
            format,
        } => {
            let rows: Vec<TaskInfo> = manager
                .list_tasks()
                .await?
                .into_iter()
                .filter(|r| !running || r.status == TaskStatus::Running)
                .filter(|r| !stopped || r.status != TaskStatus::Running)
                .collect();
            match format {
                OutputFormat::Text => println!("{}", render_table(&rows)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Cmd::Start { name } => {
            let info = manager.start_task(&name).await?;
            println!("started {name} (pid {})", info.pid);
        }
        Cmd::Stop { name } => {
            manager.stop_task(&name).await?;
            println!("stopped {name}");
        }
        Cmd::Restart { name } => {
            let info = manager.restart_task(&name).await?;
            println!("restarted {name} (pid {})", info.pid);
        }
        Cmd::Info { name, format } => {
            let detail = manager.get_detail(&name)?;
            match format {
                OutputFormat::Text => println!("{}", render_detail(&detail)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
            }
        }
        Cmd::Version => println!("{}", build_info::banner()),
    }
    Ok(())
}

fn fmt_time(t: Option<DateTime<Local>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn retries(info: &TaskInfo) -> String {
    if info.max_retry_num == 0 {
        format!("{}/unlimited", info.retry_num)
    } else {
        format!("{}/{}", info.retry_num, info.max_retry_num)
    }
}

fn pad(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - len))
}

fn border(widths: &[usize]) -> String {
    let mut out = String::from("+");
    for w in widths {
        // One padding space on each side of the cell.
        out.push_str(&"-".repeat(w + 2));
        out.push('+');
    }
    out
}

fn row_line(cols: &[String], widths: &[usize]) -> String {
    let mut out = String::from("|");
    for (i, w) in widths.iter().enumerate() {
        let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
        out.push(' ');
        out.push_str(&pad(v, *w));
        out.push_str(" |");
    }
    out
}

pub fn render_table(rows: &[TaskInfo]) -> String {
    if rows.is_empty() {
        return "(no tasks)".to_string();
    }
    let headers = ["name", "status", "pid", "auto", "retries", "exit", "started", "command"];
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let pid = if r.pid > 0 { r.pid.to_string() } else { "-".to_string() };
            let mut status = r.status.to_string();
            if r.stopped_by_operator && r.status != TaskStatus::Running {
                status.push_str(" (user)");
            }
            vec![
                r.name.clone(),
                status,
                pid,
                if r.auto_start { "yes" } else { "no" }.to_string(),
                if r.builtin { "-".to_string() } else { retries(r) },
                r.exit_code.to_string(),
                fmt_time(r.start_time),
                r.executable.clone(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for cols in &body {
        for (w, c) in widths.iter_mut().zip(cols) {
            *w = (*w).max(c.chars().count());
        }
    }

    let sep = border(&widths);
    let mut out = vec![sep.clone()];
    out.push(row_line(&headers.map(String::from), &widths));
    out.push(sep.clone());
    for cols in &body {
        out.push(row_line(cols, &widths));
    }
    out.push(sep);
    out.join("\n")
}

pub fn render_detail(d: &TaskDetail) -> String {
    let i = &d.info;
    let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let path = |v: &Option<PathBuf>| v.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        ("name", i.name.clone()),
        ("display name", opt(&d.display_name)),
        ("description", opt(&d.description)),
        ("status", i.status.to_string()),
        ("pid", if i.pid > 0 { i.pid.to_string() } else { "-".to_string() }),
        ("command", i.executable.clone()),
        ("workdir", d.workdir.display().to_string()),
        ("inherit env", d.inherit_env.to_string()),
        ("env", if d.env.is_empty() { "-".to_string() } else { d.env.join(" ") }),
        ("stdin", path(&d.io.stdin_path)),
        ("stdout", path(&d.io.stdout_path)),
        ("stderr", path(&d.io.stderr_path)),
        ("auto start", i.auto_start.to_string()),
        ("retries", retries(i)),
        ("restart delay", opt(&d.restart_delay)),
        ("started", fmt_time(i.start_time)),
        ("ended", fmt_time(i.end_time)),
        ("exit code", i.exit_code.to_string()),
        ("stopped by user", i.stopped_by_operator.to_string()),
    ];
    if let Some(e) = &i.last_error {
        lines.push(("last error", e.clone()));
    }
    let width = lines.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    lines
        .into_iter()
        .map(|(k, v)| format!("{}  {v}", pad(&format!("{k}:"), width + 1)))
        .collect::<Vec<_>>()
        .join("\n")
}
