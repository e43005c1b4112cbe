//! File logging for the hook binary.
//!
//! Hooks run with stdout/stderr owned by Claude Code, so diagnostics go to a
//! daily-rotated file under `~/.claude-monitor/logs/`.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CLAUDE_MONITOR_HOOK_LOG";
const DEFAULT_FILTER: &str = "warn";
const LOG_FILE_PREFIX: &str = "hook.log";

/// Installs the global subscriber. The returned guard must outlive all logging.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".claude-monitor").join("logs");
    if fs_err::create_dir_all(&log_dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = env::var(LOG_ENV)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
