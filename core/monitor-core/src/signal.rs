//! Normalized activity signals.
//!
//! A [`SignalEvent`] is what every capture source (process scanner, network
//! poller, HTTP parser, Claude hooks) hands to the tracker. Optional fields are
//! only populated for the kinds that carry them; absence is an expected state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ProcessExec,
    NetworkConnect,
    HttpRequest,
    ProcessExit,
    /// Claude began a long-running turn; idle detection is suspended.
    ProcessingStart,
    /// Claude is still working; refreshes the suspension ceiling only.
    ProcessingProgress,
    /// Claude finished its turn; idle detection resumes.
    ProcessingEnd,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::ProcessExec => "process_exec",
            SignalKind::NetworkConnect => "network_connect",
            SignalKind::HttpRequest => "http_request",
            SignalKind::ProcessExit => "process_exit",
            SignalKind::ProcessingStart => "processing_start",
            SignalKind::ProcessingProgress => "processing_progress",
            SignalKind::ProcessingEnd => "processing_end",
        }
    }

    pub fn is_processing(self) -> bool {
        matches!(
            self,
            SignalKind::ProcessingStart | SignalKind::ProcessingProgress | SignalKind::ProcessingEnd
        )
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SignalKind,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub http_uri: Option<String>,
    #[serde(default)]
    pub byte_size: Option<u64>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
    /// Owning user. `None` means the tracker's configured default user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Work context within the session. `None` means the configured default project.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

impl SignalEvent {
    pub fn new(kind: SignalKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            http_method: None,
            http_uri: None,
            byte_size: None,
            process_id: None,
            process_name: None,
            user_id: None,
            project: None,
            prompt_id: None,
        }
    }

    pub fn process_exec(timestamp: DateTime<Utc>, pid: u32, name: &str) -> Self {
        let mut event = Self::new(SignalKind::ProcessExec, timestamp);
        event.process_id = Some(pid);
        event.process_name = Some(name.to_string());
        event
    }

    pub fn process_exit(timestamp: DateTime<Utc>, pid: u32, name: &str) -> Self {
        let mut event = Self::new(SignalKind::ProcessExit, timestamp);
        event.process_id = Some(pid);
        event.process_name = Some(name.to_string());
        event
    }

    pub fn http_request(
        timestamp: DateTime<Utc>,
        method: Option<&str>,
        uri: Option<&str>,
        byte_size: Option<u64>,
    ) -> Self {
        let mut event = Self::new(SignalKind::HttpRequest, timestamp);
        event.http_method = method.map(str::to_string);
        event.http_uri = uri.map(str::to_string);
        event.byte_size = byte_size;
        event
    }

    pub fn network_connect(timestamp: DateTime<Utc>, byte_size: Option<u64>) -> Self {
        let mut event = Self::new(SignalKind::NetworkConnect, timestamp);
        event.byte_size = byte_size;
        event
    }

    pub fn processing(kind: SignalKind, timestamp: DateTime<Utc>) -> Self {
        debug_assert!(kind.is_processing());
        Self::new(kind, timestamp)
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn with_prompt(mut self, prompt_id: &str) -> Self {
        self.prompt_id = Some(prompt_id.to_string());
        self
    }

    /// Method with surrounding whitespace removed; blank methods count as absent.
    pub fn normalized_method(&self) -> Option<String> {
        self.http_method
            .as_deref()
            .map(str::trim)
            .filter(|method| !method.is_empty())
            .map(str::to_ascii_uppercase)
    }

    pub fn user_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        non_blank(self.user_id.as_deref()).unwrap_or(fallback)
    }

    pub fn project_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        non_blank(self.project.as_deref()).unwrap_or(fallback)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Identifies one work context: a project inside a session.
///
/// Idle tracking and open work blocks are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub session_id: String,
    pub project: String,
}

impl ContextKey {
    pub fn new(session_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.project)
    }
}
