//! claude-monitor-hook: reports Claude Code activity to the monitor daemon.
//!
//! Called by Claude Code hooks configured in ~/.claude/settings.json.
//!
//! ## Subcommands
//!
//! - `handle`: Main hook handler, reads JSON from stdin
//! - `signal`: Send one activity signal by hand
//! - `status`: Print the active session and open work blocks

mod daemon_client;
mod error;
mod handle;
mod logging;
mod status;

use clap::{Parser, Subcommand, ValueEnum};
use claude_monitor_protocol::{SignalEnvelope, SignalType};
use error::{HookError, HookResult};

#[derive(Parser)]
#[command(name = "claude-monitor-hook")]
#[command(about = "Claude activity monitor hook")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalArg {
    ProcessExec,
    ProcessExit,
    NetworkConnect,
    HttpRequest,
    ProcessingStart,
    ProcessingProgress,
    ProcessingEnd,
}

impl From<SignalArg> for SignalType {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::ProcessExec => SignalType::ProcessExec,
            SignalArg::ProcessExit => SignalType::ProcessExit,
            SignalArg::NetworkConnect => SignalType::NetworkConnect,
            SignalArg::HttpRequest => SignalType::HttpRequest,
            SignalArg::ProcessingStart => SignalType::ProcessingStart,
            SignalArg::ProcessingProgress => SignalType::ProcessingProgress,
            SignalArg::ProcessingEnd => SignalType::ProcessingEnd,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a hook event (reads JSON from stdin)
    Handle,

    /// Send a single activity signal to the daemon
    Signal {
        #[arg(value_enum)]
        kind: SignalArg,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// HTTP method, for http-request signals
        #[arg(long)]
        method: Option<String>,

        /// Request path, for http-request signals
        #[arg(long)]
        uri: Option<String>,

        /// Payload size in bytes
        #[arg(long)]
        bytes: Option<u64>,

        /// Process id, required for process-exec and process-exit
        #[arg(long)]
        pid: Option<u32>,

        #[arg(long)]
        process_name: Option<String>,
    },

    /// Show the active session and open work blocks
    Status {
        #[arg(long)]
        user: Option<String>,

        /// Include today's work summary
        #[arg(long)]
        summary: bool,

        /// Print raw JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => {
            if let Err(e) = handle::run() {
                tracing::error!(error = %e, "claude-monitor-hook handle failed");
                std::process::exit(1);
            }
        }
        Commands::Signal {
            kind,
            project,
            user,
            method,
            uri,
            bytes,
            pid,
            process_name,
        } => {
            let mut envelope = SignalEnvelope::new(
                daemon_client::make_event_id(std::process::id()),
                daemon_client::recorded_now(),
                kind.into(),
            );
            envelope.project = project;
            envelope.user_id = user;
            envelope.http_method = method;
            envelope.http_uri = uri;
            envelope.byte_size = bytes;
            envelope.pid = pid;
            envelope.process_name = process_name;

            match send_manual(&envelope) {
                Ok(outcome) => println!("{}", outcome),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Status {
            user,
            summary,
            json,
        } => {
            if let Err(e) = status::run(user.as_deref(), summary, json) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

fn send_manual(envelope: &SignalEnvelope) -> HookResult<serde_json::Value> {
    if !daemon_client::daemon_enabled() {
        return Err(HookError::Disabled);
    }
    envelope
        .validate()
        .map_err(|err| HookError::InvalidArgument(format!("{}: {}", err.code, err.message)))?;
    daemon_client::send_signal(envelope, "manual signal").map_err(HookError::Daemon)
}
