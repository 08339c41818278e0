use std::fmt;

/// Operations that are never allowed on the builtin daemon task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    Add,
    Edit,
    Delete,
}

impl fmt::Display for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuiltinOp::Add => "add",
            BuiltinOp::Edit => "edit",
            BuiltinOp::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task '{0}' already exists")]
    AlreadyExists(String),

    #[error("task '{0}' does not exist")]
    NotFound(String),

    #[error("task '{0}' is already running")]
    AlreadyRunning(String),

    #[error("task '{0}' is not running")]
    NotRunning(String),

    #[error("task '{0}' was stopped by the operator")]
    StoppedByOperator(String),

    #[error("cannot {op} builtin task '{name}': the name is reserved for the monitor daemon")]
    Builtin { name: String, op: BuiltinOp },

    #[error("invalid task definition '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("failed to start task '{name}' (executable {executable:?}): {source}")]
    Spawn {
        name: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to terminate task '{name}' (pid {pid}): {source}")]
    Terminate {
        name: String,
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("daemon is already running (pid {0})")]
    DaemonAlreadyRunning(u32),

    #[error("daemon is not running")]
    DaemonNotRunning,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        TaskError::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for the "nothing to do" outcomes a caller may want to report but not treat as fatal.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            TaskError::AlreadyRunning(_)
                | TaskError::NotRunning(_)
                | TaskError::StoppedByOperator(_)
                | TaskError::DaemonAlreadyRunning(_)
                | TaskError::DaemonNotRunning
        )
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
