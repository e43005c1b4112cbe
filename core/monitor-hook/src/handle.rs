//! Main hook handler.
//!
//! Reads a Claude Code hook payload from stdin and forwards the matching
//! activity signal to the daemon. Hook names that carry no activity meaning
//! (notifications, permission prompts) are dropped silently.

use crate::daemon_client;
use crate::error::HookResult;
use claude_monitor_protocol::{SignalEnvelope, SignalType};
use serde::Deserialize;
use std::io::{self, Read};
use std::path::Path;

const CLAUDE_PROCESS_NAME: &str = "claude";

#[derive(Debug, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub stop_hook_active: Option<bool>,
}

impl HookInput {
    fn event_name(&self) -> &str {
        self.hook_event_name.as_deref().unwrap_or("")
    }

    /// Basename of the hook's working directory.
    pub fn project(&self) -> Option<String> {
        let cwd = self.cwd.as_deref()?.trim_end_matches('/');
        Path::new(cwd)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

pub fn run() -> HookResult<()> {
    let mut raw = String::new();
    io::stdin().read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(());
    }

    let input: HookInput = serde_json::from_str(&raw)?;
    if !daemon_client::daemon_enabled() {
        tracing::debug!(event = input.event_name(), "Daemon disabled; skipping hook");
        return Ok(());
    }

    let ppid = get_ppid();
    let Some(signal_type) = signal_type_for(&input) else {
        tracing::debug!(event = input.event_name(), "Hook event carries no activity signal");
        return Ok(());
    };

    let envelope = build_envelope(
        &input,
        signal_type,
        ppid,
        daemon_client::make_event_id(ppid),
        daemon_client::recorded_now(),
    );

    // The daemon being down must not fail the user's Claude session.
    match daemon_client::send_signal(&envelope, input.event_name()) {
        Ok(outcome) => {
            tracing::debug!(
                event = input.event_name(),
                tool = input.tool_name.as_deref().unwrap_or(""),
                outcome = %outcome,
                "Hook signal delivered"
            );
        }
        Err(err) => {
            tracing::warn!(event = input.event_name(), error = %err, "Hook signal not delivered");
        }
    }
    Ok(())
}

pub fn signal_type_for(input: &HookInput) -> Option<SignalType> {
    match input.event_name() {
        "SessionStart" => Some(SignalType::ProcessExec),
        "SessionEnd" => Some(SignalType::ProcessExit),
        "UserPromptSubmit" => Some(SignalType::ProcessingStart),
        "PreToolUse" | "PostToolUse" | "PostToolUseFailure" | "PreCompact" | "SubagentStart"
        | "SubagentStop" => Some(SignalType::ProcessingProgress),
        // A blocking stop hook keeps Claude working.
        "Stop" if input.stop_hook_active == Some(true) => Some(SignalType::ProcessingProgress),
        "Stop" => Some(SignalType::ProcessingEnd),
        _ => None,
    }
}

pub fn build_envelope(
    input: &HookInput,
    signal_type: SignalType,
    pid: u32,
    event_id: String,
    recorded_at: String,
) -> SignalEnvelope {
    let mut envelope = SignalEnvelope::new(event_id, recorded_at, signal_type);
    envelope.project = input.project();
    match signal_type {
        SignalType::ProcessExec | SignalType::ProcessExit => {
            envelope.pid = Some(pid);
            envelope.process_name = Some(CLAUDE_PROCESS_NAME.to_string());
        }
        _ => {
            envelope.prompt_id = input
                .session_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(str::to_string);
        }
    }
    envelope
}

fn get_ppid() -> u32 {
    // SAFETY: getppid has no preconditions and cannot fail.
    let ppid = unsafe { libc::getppid() };
    u32::try_from(ppid).unwrap_or(0)
}
