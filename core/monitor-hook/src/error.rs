use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to read hook input: {0}")]
    Stdin(#[from] std::io::Error),

    #[error("Failed to parse hook input: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Daemon disabled via CLAUDE_MONITOR_DAEMON_ENABLED")]
    Disabled,

    #[error("Daemon request failed: {0}")]
    Daemon(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type HookResult<T> = Result<T, HookError>;
