//! Client helper for talking to the claude-monitor daemon.
//!
//! The daemon owns all tracking state. A failed send is reported to the
//! caller and never buffered locally.

use chrono::{SecondsFormat, Utc};
use claude_monitor_protocol::{
    Method, Request, Response, SignalEnvelope, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const ENABLE_ENV: &str = "CLAUDE_MONITOR_DAEMON_ENABLED";
const SOCKET_ENV: &str = "CLAUDE_MONITOR_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

/// Sends a signal, retrying once with the same event id so the daemon can
/// recognise a replay if the first response was lost.
pub fn send_signal(envelope: &SignalEnvelope, label: &str) -> Result<Value, String> {
    if let Err(err) = envelope.validate() {
        return Err(format!("{}: {}", err.code, err.message));
    }

    match send_signal_once(envelope) {
        Ok(data) => Ok(data),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_signal_once(envelope).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    "Retry failed sending {} to daemon",
                    label
                );
                retry_err
            })
        }
    }
}

/// Issues a read-only query and returns the response payload.
pub fn query(method: Method, params: Option<Value>) -> Result<Value, String> {
    let request = Request::new(method, params);
    let response = send_request(&request)?;
    into_data(response)
}

pub fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}

pub fn recorded_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn send_signal_once(envelope: &SignalEnvelope) -> Result<Value, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Signal,
        id: Some(envelope.event_id.clone()),
        params: Some(
            serde_json::to_value(envelope)
                .map_err(|err| format!("Failed to serialize signal: {}", err))?,
        ),
    };
    let response = send_request(&request)?;
    into_data(response)
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let message = response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string());
        Err(message)
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".claude-monitor").join(SOCKET_NAME))
}

fn send_request(request: &Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_monitor_protocol::SignalType;
    use std::os::unix::net::UnixListener;
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }

        fn unset(key: &'static str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }
        let end = buffer.iter().position(|b| *b == b'\n').unwrap_or(buffer.len());
        serde_json::from_slice(&buffer[..end]).ok()
    }

    /// Fake daemon: answers up to `replies.len()` connections. `None` drops
    /// the connection without replying.
    fn spawn_fake_daemon(
        replies: Vec<Option<Response>>,
    ) -> (PathBuf, Arc<Mutex<Vec<Request>>>, std::thread::JoinHandle<()>) {
        let socket_dir = std::path::Path::new("/tmp").join(format!(
            "cmh-{}-{}",
            std::process::id(),
            rand::thread_rng().next_u32()
        ));
        std::fs::create_dir_all(&socket_dir).unwrap();
        let socket_path = socket_dir.join(SOCKET_NAME);
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();

        let seen: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut replies = replies.into_iter();
            let mut remaining = replies.len();
            while remaining > 0 && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        remaining -= 1;
                        stream.set_nonblocking(false).unwrap();
                        if let Some(request) = read_request(&mut stream) {
                            seen_clone.lock().unwrap().push(request);
                        }
                        if let Some(Some(response)) = replies.next() {
                            let mut payload = serde_json::to_vec(&response).unwrap();
                            payload.push(b'\n');
                            let _ = stream.write_all(&payload);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        (socket_path, seen, server)
    }

    fn envelope() -> SignalEnvelope {
        let mut envelope =
            SignalEnvelope::new(make_event_id(42), recorded_now(), SignalType::ProcessingStart);
        envelope.project = Some("crate".to_string());
        envelope
    }

    #[test]
    fn send_signal_retries_after_daemon_error() {
        let _guard = env_lock();
        let (socket_path, seen, server) = spawn_fake_daemon(vec![
            Some(Response::error(None, "test_error", "simulated")),
            Some(Response::ok(None, serde_json::json!({"outcome": "recorded"}))),
        ]);
        let _socket = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());
        let _enabled = EnvGuard::set(ENABLE_ENV, "1");

        let data = send_signal(&envelope(), "test signal").expect("retry succeeds");
        server.join().unwrap();

        assert_eq!(data["outcome"], "recorded");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn retry_reuses_event_id_after_lost_response() {
        let _guard = env_lock();
        let (socket_path, seen, server) = spawn_fake_daemon(vec![
            None,
            Some(Response::ok(None, serde_json::json!({"outcome": "recorded"}))),
        ]);
        let _socket = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let signal = envelope();
        send_signal(&signal, "test signal").expect("retry succeeds");
        server.join().unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, requests[1].id);
        assert_eq!(requests[0].id.as_deref(), Some(signal.event_id.as_str()));
        let sent: SignalEnvelope =
            serde_json::from_value(requests[1].params.clone().unwrap()).unwrap();
        assert_eq!(sent, signal);
    }

    #[test]
    fn invalid_signal_is_rejected_before_connecting() {
        let _guard = env_lock();
        let _socket = EnvGuard::set(SOCKET_ENV, "/tmp/claude-monitor-no-such.sock");

        let mut signal = envelope();
        signal.signal_type = SignalType::ProcessExec;
        let err = send_signal(&signal, "test signal").expect_err("pid is required");
        assert!(err.starts_with("invalid_pid"), "unexpected error: {}", err);
    }

    #[test]
    fn missing_socket_is_an_error() {
        let _guard = env_lock();
        let _socket = EnvGuard::set(SOCKET_ENV, "/tmp/claude-monitor-no-such.sock");
        let err = query(Method::GetHealth, None).expect_err("no daemon");
        assert!(err.contains("connect"), "unexpected error: {}", err);
    }

    #[test]
    fn daemon_enabled_defaults_to_true_when_env_missing() {
        let _guard = env_lock();
        let _unset = EnvGuard::unset(ENABLE_ENV);
        assert!(daemon_enabled());
    }

    #[test]
    fn daemon_enabled_is_false_when_env_zero() {
        let _guard = env_lock();
        let _set = EnvGuard::set(ENABLE_ENV, "0");
        assert!(!daemon_enabled());
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(make_event_id(1), make_event_id(1));
    }
}
