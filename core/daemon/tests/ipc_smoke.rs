use chrono::{Duration as ChronoDuration, Utc};
use claude_monitor_protocol::{
    Method, Request, Response, SignalEnvelope, SignalType, PROTOCOL_VERSION,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    let config_path = home.join("monitor-test.toml");
    std::fs::write(
        &config_path,
        "[tracking]\ndefault_user_id = \"tester\"\n\n[scanner]\nenabled = false\n",
    )
    .expect("Failed to write test config");

    Command::new(env!("CARGO_BIN_EXE_claude-monitor-daemon"))
        .env("HOME", home)
        .env("CLAUDE_MONITOR_CONFIG", &config_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn claude-monitor-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".claude-monitor").join("daemon.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn send_signal(socket: &Path, signal: &SignalEnvelope) -> Response {
    send_request(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::Signal,
            id: Some(signal.event_id.clone()),
            params: Some(serde_json::to_value(signal).expect("Failed to serialize signal")),
        },
    )
}

fn http_signal(
    event_id: &str,
    at: chrono::DateTime<Utc>,
    method: &str,
    uri: &str,
) -> SignalEnvelope {
    let mut signal = SignalEnvelope::new(event_id, at.to_rfc3339(), SignalType::HttpRequest);
    signal.project = Some("repo".to_string());
    signal.http_method = Some(method.to_string());
    signal.http_uri = Some(uri.to_string());
    signal.byte_size = Some(12);
    signal
}

fn outcome(response: &Response) -> &str {
    response
        .data
        .as_ref()
        .and_then(|data| data.get("outcome"))
        .and_then(|value| value.as_str())
        .unwrap_or("missing")
}

#[test]
fn daemon_ipc_tracks_sessions_and_work_blocks_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };

    wait_for_socket(&socket, Duration::from_secs(2));

    let health = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        },
    );
    assert!(health.ok, "health response was not ok");
    let data = health.data.as_ref().expect("health payload");
    assert_eq!(data.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(
        data.pointer("/monitor/default_user").and_then(|v| v.as_str()),
        Some("tester")
    );

    let no_session = send_request(
        &socket,
        Request::new(Method::GetActiveSession, None),
    );
    assert!(no_session.ok, "active session response was not ok");
    assert!(no_session.data.map_or(true, |data| data.is_null()));

    let now = Utc::now();

    // Background health probe never opens anything.
    let probe = send_signal(
        &socket,
        &http_signal("evt-probe", now - ChronoDuration::minutes(4), "GET", "/health"),
    );
    assert!(probe.ok, "probe response was not ok");
    assert_eq!(outcome(&probe), "not_activity");

    // A tiny POST is still user activity.
    let post = send_signal(
        &socket,
        &http_signal("evt-post", now - ChronoDuration::minutes(3), "POST", "/v1/messages"),
    );
    assert!(post.ok, "post response was not ok");
    assert_eq!(outcome(&post), "recorded");
    let session_id = post
        .data
        .as_ref()
        .and_then(|data| data.get("session_id"))
        .and_then(|value| value.as_str())
        .expect("session id")
        .to_string();

    // A client retry with the same event id is not counted twice.
    let replay = send_signal(
        &socket,
        &http_signal("evt-post", now - ChronoDuration::minutes(3), "POST", "/v1/messages"),
    );
    assert!(replay.ok, "replay response was not ok");
    assert_eq!(outcome(&replay), "duplicate");

    let mut start = SignalEnvelope::new(
        "evt-start",
        (now - ChronoDuration::minutes(1)).to_rfc3339(),
        SignalType::ProcessingStart,
    );
    start.project = Some("repo".to_string());
    let start_response = send_signal(&socket, &start);
    assert_eq!(outcome(&start_response), "recorded");

    let active = send_request(
        &socket,
        Request::new(
            Method::GetActiveSession,
            Some(serde_json::json!({ "user_id": "tester" })),
        ),
    );
    assert!(active.ok, "active session response was not ok");
    let active_data = active.data.expect("active session payload");
    assert_eq!(
        active_data.get("id").and_then(|v| v.as_str()),
        Some(session_id.as_str())
    );
    assert_eq!(active_data.get("state").and_then(|v| v.as_str()), Some("active"));
    assert_eq!(
        active_data.get("activity_count").and_then(|v| v.as_u64()),
        Some(2)
    );

    let block = send_request(
        &socket,
        Request::new(
            Method::GetOpenWorkBlock,
            Some(serde_json::json!({ "session_id": session_id, "project": "repo" })),
        ),
    );
    assert!(block.ok, "open work block response was not ok");
    let block_data = block.data.expect("open work block payload");
    assert_eq!(
        block_data.get("activity_count").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(block_data.get("processing").and_then(|v| v.as_bool()), Some(true));

    let listed = send_request(&socket, Request::new(Method::ListOpenWorkBlocks, None));
    let listed_array = listed
        .data
        .as_ref()
        .and_then(|data| data.as_array())
        .expect("open work blocks array")
        .clone();
    assert_eq!(listed_array.len(), 1);

    let flush = send_request(&socket, Request::new(Method::Flush, None));
    assert!(flush.ok, "flush response was not ok");
    assert_eq!(
        flush.data.as_ref().and_then(|d| d.get("closed")).and_then(|v| v.as_u64()),
        Some(1)
    );

    let listed_after = send_request(&socket, Request::new(Method::ListOpenWorkBlocks, None));
    assert_eq!(
        listed_after.data.as_ref().and_then(|d| d.as_array()).map(|a| a.len()),
        Some(0)
    );

    let day = (now - ChronoDuration::minutes(3))
        .with_timezone(&chrono::Local)
        .date_naive()
        .format("%Y-%m-%d")
        .to_string();
    let summary = send_request(
        &socket,
        Request::new(Method::GetSummary, Some(serde_json::json!({ "date": day }))),
    );
    assert!(summary.ok, "summary response was not ok");
    let summary_data = summary.data.expect("summary payload");
    assert_eq!(summary_data.get("block_count").and_then(|v| v.as_u64()), Some(1));
    let worked = summary_data
        .get("total_work_seconds")
        .and_then(|v| v.as_i64())
        .unwrap_or_default();
    assert!((110..=130).contains(&worked), "unexpected work seconds {}", worked);
}
