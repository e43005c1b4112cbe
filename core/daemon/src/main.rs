//! Claude activity monitor daemon entrypoint.
//!
//! A small, single-writer service: a socket listener with strict request
//! validation, one in-memory activity tracker, and a SQLite store written
//! behind it. Two background threads sweep idle work blocks and scan the
//! process table.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use claude_monitor_protocol::{
    parse_active_session, parse_open_work_block, parse_signal, parse_summary, ErrorInfo, Method,
    Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

mod config;
mod db;
mod process;
mod state;

use db::Db;
use process::ProcessScanner;
use state::{outcome_json, signal_from_envelope, SharedState};

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const SHUTDOWN_POLL_MILLIS: u64 = 200;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let monitor_config = config::load_or_default(None);
    info!(
        session_duration_secs = monitor_config.tracking.session_duration_secs,
        idle_threshold_secs = monitor_config.tracking.idle_threshold_secs,
        processing_ceiling_secs = monitor_config.tracking.processing_ceiling_secs,
        scanner_enabled = monitor_config.scanner.enabled,
        "Monitor config loaded"
    );

    let shared_state = match SharedState::new(db, monitor_config) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon state");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Claude monitor daemon started");

    install_signal_handlers();
    spawn_shutdown_watcher(Arc::clone(&shared_state), socket_path);
    spawn_idle_sweeper(Arc::clone(&shared_state));
    if shared_state.config().scanner.enabled {
        spawn_process_scanner(Arc::clone(&shared_state));
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = request_shutdown as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn spawn_shutdown_watcher(state: Arc<SharedState>, socket_path: PathBuf) {
    thread::spawn(move || {
        while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(SHUTDOWN_POLL_MILLIS));
        }
        info!("Shutdown requested; flushing open work blocks");
        state.shutdown();
        if let Err(err) = remove_existing_socket(&socket_path) {
            warn!(error = %err, "Failed to remove daemon socket on shutdown");
        }
        info!("Claude monitor daemon stopped");
        std::process::exit(0);
    });
}

fn spawn_idle_sweeper(state: Arc<SharedState>) {
    let interval = state.config().tracking.sweep_interval_secs.max(1);
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(interval));
        let closed = state.sweep();
        if !closed.is_empty() {
            tracing::debug!(closed = closed.len(), "Periodic sweep closed work blocks");
        }
    });
}

fn spawn_process_scanner(state: Arc<SharedState>) {
    let scanner_config = state.config().scanner.clone();
    let interval = scanner_config.interval_secs.max(1);
    thread::spawn(move || {
        let mut scanner = ProcessScanner::new(&scanner_config.process_names);
        loop {
            for event in scanner.scan(chrono::Utc::now()) {
                if let Err(err) = state.ingest(&event) {
                    warn!(
                        error = %err,
                        kind = %event.kind,
                        pid = ?event.process_id,
                        "Failed to ingest scanner signal"
                    );
                }
            }
            thread::sleep(Duration::from_secs(interval));
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("CLAUDE_MONITOR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn monitor_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".claude-monitor"))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(monitor_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(monitor_home()?.join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            let health = state.health_snapshot();
            if health.persistence.degraded {
                data["status"] = Value::from("degraded");
            }
            if let Ok(value) = serde_json::to_value(health) {
                data["monitor"] = value;
            }
            Response::ok(id, data)
        }
        Method::Signal => handle_signal(id, request.params, state),
        Method::GetActiveSession => {
            let params = match parse_active_session(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.active_session(params.user_id.as_deref()) {
                Ok(session) => to_response(id, &session, "active session"),
                Err(err) => Response::error(
                    id,
                    "session_error",
                    format!("Failed to fetch active session: {}", err),
                ),
            }
        }
        Method::GetOpenWorkBlock => {
            let params = match parse_open_work_block(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let block = state.open_work_block(&params.session_id, &params.project);
            to_response(id, &block, "open work block")
        }
        Method::ListOpenWorkBlocks => {
            let blocks = state.open_work_blocks();
            tracing::debug!(blocks = blocks.len(), "Open work blocks snapshot");
            to_response(id, &blocks, "open work blocks")
        }
        Method::GetSummary => {
            let params = match parse_summary(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let date = match params.parsed_date() {
                Ok(date) => date,
                Err(err) => return Response::error_with_info(id, err),
            };
            match state.summary_for(date) {
                Ok(summary) => to_response(id, &summary, "summary"),
                Err(err) => Response::error(
                    id,
                    "summary_error",
                    format!("Failed to build summary: {}", err),
                ),
            }
        }
        Method::Flush => {
            let closed = state.flush();
            info!(closed = closed.len(), "Flush requested over IPC");
            Response::ok(id, serde_json::json!({ "closed": closed.len() }))
        }
    }
}

fn handle_signal(id: Option<String>, params: Option<Value>, state: &SharedState) -> Response {
    let params = match params {
        Some(params) => params,
        None => return Response::error(id, "invalid_params", "signal payload is required"),
    };

    let envelope = match parse_signal(params) {
        Ok(envelope) => envelope,
        Err(err) => return Response::error_with_info(id, err),
    };

    let event = match signal_from_envelope(&envelope) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(id, err),
    };

    tracing::debug!(
        event_id = %envelope.event_id,
        signal_type = ?envelope.signal_type,
        project = ?envelope.project,
        method = ?envelope.http_method,
        bytes = ?envelope.byte_size,
        "Received signal"
    );

    match state.ingest_signal(&envelope.event_id, &event) {
        Ok(Some(outcome)) => Response::ok(id, outcome_json(&outcome)),
        Ok(None) => Response::ok(
            id,
            serde_json::json!({"accepted": true, "outcome": "duplicate"}),
        ),
        Err(err) => {
            warn!(error = %err, event_id = %envelope.event_id, "Failed to ingest signal");
            Response::error(id, "ingest_error", format!("Failed to ingest signal: {}", err))
        }
    }
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", label, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
