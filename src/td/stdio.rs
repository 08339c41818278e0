use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Resolve a configured stdio path: absolute paths as-is, relative ones against `workdir`.
pub fn resolve_path(path: &str, workdir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workdir.join(p)
    }
}

/// Resolved stdio locations for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<PathBuf>,
    /// stdout and stderr go to the same file.
    pub same_output: bool,
}

impl IoInfo {
    pub fn resolve(stdin: Option<&str>, stdout: Option<&str>, stderr: Option<&str>, workdir: &Path) -> Self {
        let stdin_path = stdin.map(|p| resolve_path(p, workdir));
        let stdout_path = stdout.map(|p| resolve_path(p, workdir));
        let stderr_path = stderr.map(|p| resolve_path(p, workdir));
        let same_output = matches!((&stdout_path, &stderr_path), (Some(a), Some(b)) if a == b);
        Self {
            stdin_path,
            stdout_path,
            stderr_path,
            same_output,
        }
    }
}

/// Open handles for a task's stdio. Outputs are appended to; missing parent directories are
/// created. A stream without a configured path is attached to the null device.
#[derive(Debug, Default)]
pub struct TaskIo {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

fn open_output(path: &Path, what: &str) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("failed to create {what} directory {}: {e}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {what} file {}: {e}", path.display()))
}

impl TaskIo {
    pub fn open(info: &IoInfo) -> anyhow::Result<Self> {
        let mut io = TaskIo::default();
        if let Some(p) = &info.stdin_path {
            anyhow::ensure!(p.is_file(), "stdin file {} does not exist or is not a regular file", p.display());
            io.stdin = Some(
                File::open(p).map_err(|e| anyhow::anyhow!("failed to open stdin file {}: {e}", p.display()))?,
            );
        }
        if let Some(p) = &info.stdout_path {
            io.stdout = Some(open_output(p, "stdout")?);
        }
        if let Some(p) = &info.stderr_path {
            io.stderr = Some(if info.same_output {
                match &io.stdout {
                    Some(f) => f.try_clone()?,
                    None => open_output(p, "stderr")?,
                }
            } else {
                open_output(p, "stderr")?
            });
        }
        Ok(io)
    }

    fn stdio_for(f: &Option<File>) -> anyhow::Result<Stdio> {
        Ok(match f {
            Some(f) => Stdio::from(f.try_clone()?),
            None => Stdio::null(),
        })
    }

    /// Wire the handles into a command. Duplicates are handed over, so this value keeps its own
    /// handles until [`TaskIo::release`].
    pub fn attach(&self, cmd: &mut tokio::process::Command) -> anyhow::Result<()> {
        cmd.stdin(Self::stdio_for(&self.stdin)?);
        cmd.stdout(Self::stdio_for(&self.stdout)?);
        cmd.stderr(Self::stdio_for(&self.stderr)?);
        Ok(())
    }

    pub fn open_handles(&self) -> usize {
        [&self.stdin, &self.stdout, &self.stderr]
            .iter()
            .filter(|h| h.is_some())
            .count()
    }

    /// Close all handles held by the supervisor side.
    pub fn release(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}
