use crate::td::config::Settings;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Overrides the configured level, with the usual `EnvFilter` directive syntax.
pub const LOG_ENV: &str = "TASKD_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Interactive command: stderr, quiet unless asked.
    Command { verbose: bool },
    /// Detached daemon: append to the configured log file.
    Daemon,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(mode: LogMode, settings: &Settings) -> anyhow::Result<()> {
    match mode {
        LogMode::Command { verbose } => {
            let level = if verbose { settings.log_level.as_str() } else { "warn" };
            let _ = tracing_subscriber::registry()
                .with(filter(level))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false)
                        .without_time(),
                )
                .try_init();
        }
        LogMode::Daemon => {
            if let Some(parent) = settings.log_file.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow::anyhow!("failed to create log dir {}: {e}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&settings.log_file)
                .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", settings.log_file.display()))?;
            let _ = tracing_subscriber::registry()
                .with(filter(&settings.log_level))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true),
                )
                .try_init();
        }
    }
    Ok(())
}
