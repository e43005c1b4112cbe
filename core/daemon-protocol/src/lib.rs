//! IPC protocol types and validation for claude-monitor-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

const MAX_EVENT_ID_LEN: usize = 128;
const MAX_METHOD_LEN: usize = 16;
const MAX_URI_LEN: usize = 2048;
const MAX_LABEL_LEN: usize = 256;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Signal,
    GetActiveSession,
    GetOpenWorkBlock,
    ListOpenWorkBlocks,
    GetSummary,
    Flush,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Wire name for each signal kind the daemon accepts.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SignalType {
    ProcessExec,
    NetworkConnect,
    HttpRequest,
    ProcessExit,
    ProcessingStart,
    ProcessingProgress,
    ProcessingEnd,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignalEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub signal_type: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

impl SignalEnvelope {
    pub fn new(event_id: impl Into<String>, recorded_at: impl Into<String>, signal_type: SignalType) -> Self {
        Self {
            event_id: event_id.into(),
            recorded_at: recorded_at.into(),
            signal_type,
            user_id: None,
            project: None,
            http_method: None,
            http_uri: None,
            byte_size: None,
            pid: None,
            process_name: None,
            prompt_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        limit_len(&self.user_id, "user_id", MAX_LABEL_LEN)?;
        limit_len(&self.project, "project", MAX_LABEL_LEN)?;
        limit_len(&self.process_name, "process_name", MAX_LABEL_LEN)?;
        limit_len(&self.prompt_id, "prompt_id", MAX_LABEL_LEN)?;

        match self.signal_type {
            SignalType::ProcessExec | SignalType::ProcessExit => {
                require_pid(&self.pid)?;
                reject_http_fields(self)?;
                forbid(&self.byte_size, "byte_size")?;
            }
            SignalType::HttpRequest => {
                if let Some(method) = &self.http_method {
                    validate_method(method)?;
                }
                limit_len(&self.http_uri, "http_uri", MAX_URI_LEN)?;
            }
            SignalType::NetworkConnect => {
                reject_http_fields(self)?;
            }
            SignalType::ProcessingStart
            | SignalType::ProcessingProgress
            | SignalType::ProcessingEnd => {
                reject_http_fields(self)?;
                forbid(&self.byte_size, "byte_size")?;
            }
        }

        Ok(())
    }
}

pub fn parse_signal(params: Value) -> Result<SignalEnvelope, ErrorInfo> {
    let envelope: SignalEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("signal payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActiveSessionParams {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OpenWorkBlockParams {
    pub session_id: String,
    pub project: String,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SummaryParams {
    /// Local calendar day, `YYYY-MM-DD`. Defaults to today.
    #[serde(default)]
    pub date: Option<String>,
}

impl SummaryParams {
    pub fn parsed_date(&self) -> Result<Option<NaiveDate>, ErrorInfo> {
        match self.date.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| ErrorInfo::new("invalid_date", "date must be YYYY-MM-DD")),
        }
    }
}

pub fn parse_active_session(params: Option<Value>) -> Result<ActiveSessionParams, ErrorInfo> {
    parse_optional(params, "active session")
}

pub fn parse_open_work_block(params: Option<Value>) -> Result<OpenWorkBlockParams, ErrorInfo> {
    let params = params.ok_or_else(|| {
        ErrorInfo::new("invalid_params", "session_id and project are required")
    })?;
    let parsed: OpenWorkBlockParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("open work block params are invalid: {}", err),
        )
    })?;
    require_string(&Some(parsed.session_id.clone()), "session_id")?;
    require_string(&Some(parsed.project.clone()), "project")?;
    Ok(parsed)
}

pub fn parse_summary(params: Option<Value>) -> Result<SummaryParams, ErrorInfo> {
    let parsed: SummaryParams = parse_optional(params, "summary")?;
    parsed.parsed_date()?;
    Ok(parsed)
}

fn parse_optional<T>(params: Option<Value>, label: &str) -> Result<T, ErrorInfo>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("{} params are invalid: {}", label, err),
            )
        }),
    }
}

fn validate_method(method: &str) -> Result<(), ErrorInfo> {
    let trimmed = method.trim();
    // Blank methods are accepted and treated as absent by the classifier.
    if trimmed.is_empty() {
        return Ok(());
    }
    if trimmed.len() > MAX_METHOD_LEN || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ErrorInfo::new(
            "invalid_http_method",
            "http_method must be an alphabetic HTTP token",
        ));
    }
    Ok(())
}

fn reject_http_fields(signal: &SignalEnvelope) -> Result<(), ErrorInfo> {
    forbid(&signal.http_method, "http_method")?;
    forbid(&signal.http_uri, "http_uri")
}

fn forbid<T>(value: &Option<T>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(_) => Err(ErrorInfo::new(
            "unexpected_field",
            format!("{} is not valid for this signal_type", field),
        )),
        None => Ok(()),
    }
}

fn limit_len(value: &Option<String>, field: &str, max: usize) -> Result<(), ErrorInfo> {
    match value {
        Some(candidate) if candidate.len() > max => Err(ErrorInfo::new(
            "field_too_long",
            format!("{} must be {} characters or fewer", field, max),
        )),
        _ => Ok(()),
    }
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

fn require_pid(pid: &Option<u32>) -> Result<(), ErrorInfo> {
    match pid {
        Some(0) | None => Err(ErrorInfo::new("invalid_pid", "pid is required")),
        Some(_) => Ok(()),
    }
}
