//! Per-signal activity classification.
//!
//! Answers one question for every [`SignalEvent`]: did this represent genuine
//! user interaction, background noise, or neither?
//!
//! Rules run in a fixed order and the first one that applies wins:
//!
//! 1. **HTTP method** (only when a method is present). Background endpoints are
//!    background for every method. `POST`/`PUT`/`PATCH` are user activity no
//!    matter how small the payload. `GET` is user activity only for interactive
//!    endpoints. `OPTIONS`/`HEAD` and everything else are background.
//! 2. **Byte size** (only when the method is absent). `>= burst` is a burst,
//!    `> interactive` is interactive, `< keepalive` is background, anything in
//!    between is inconclusive.
//! 3. **Kind policy**. A process launch implies user intent. Processing start/end
//!    hooks mark Claude turns. Everything else is inconclusive.
//!
//! The classifier never logs and never fails; the caller reports which rule
//! fired using [`ActivityJudgment::reason`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::patterns::{RE_HEALTH_ENDPOINT, RE_REPEATED_SLASHES};
use crate::signal::{SignalEvent, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    HttpMethod,
    ByteHeuristic,
    /// Kind-based policy (process launches).
    Policy,
    /// Explicit Claude hook callbacks.
    Hook,
    Inconclusive,
}

impl ConfidenceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceSource::HttpMethod => "http_method",
            ConfidenceSource::ByteHeuristic => "byte_heuristic",
            ConfidenceSource::Policy => "policy",
            ConfidenceSource::Hook => "hook",
            ConfidenceSource::Inconclusive => "inconclusive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityReason {
    BackgroundEndpoint,
    WriteMethod,
    InteractiveGet,
    NonInteractiveGet,
    ProbeMethod,
    OtherMethod,
    Burst,
    Interactive,
    Keepalive,
    AmbiguousSize,
    ProcessLaunch,
    ProcessingBoundary,
    NoEvidence,
}

impl fmt::Display for ActivityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ActivityReason::BackgroundEndpoint => "health/status endpoint",
            ActivityReason::WriteMethod => "write method",
            ActivityReason::InteractiveGet => "GET on interactive endpoint",
            ActivityReason::NonInteractiveGet => "GET on non-interactive endpoint",
            ActivityReason::ProbeMethod => "OPTIONS/HEAD probe",
            ActivityReason::OtherMethod => "unrecognized method",
            ActivityReason::Burst => "burst-sized payload",
            ActivityReason::Interactive => "interactive-sized payload",
            ActivityReason::Keepalive => "keepalive-sized payload",
            ActivityReason::AmbiguousSize => "payload size between keepalive and interactive",
            ActivityReason::ProcessLaunch => "process launch",
            ActivityReason::ProcessingBoundary => "processing hook",
            ActivityReason::NoEvidence => "no method or size information",
        };
        f.write_str(text)
    }
}

/// Outcome of classifying one signal. Both flags may be false (inconclusive);
/// both are never true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityJudgment {
    pub is_user_activity: bool,
    pub is_background: bool,
    pub source: ConfidenceSource,
    pub reason: ActivityReason,
}

impl ActivityJudgment {
    fn user(source: ConfidenceSource, reason: ActivityReason) -> Self {
        Self {
            is_user_activity: true,
            is_background: false,
            source,
            reason,
        }
    }

    fn background(source: ConfidenceSource, reason: ActivityReason) -> Self {
        Self {
            is_user_activity: false,
            is_background: true,
            source,
            reason,
        }
    }

    fn inconclusive(reason: ActivityReason) -> Self {
        Self {
            is_user_activity: false,
            is_background: false,
            source: ConfidenceSource::Inconclusive,
            reason,
        }
    }

    /// Only user activity may open or extend a work block.
    pub fn qualifies(&self) -> bool {
        self.is_user_activity && !self.is_background
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityClassifier {
    config: ClassifierConfig,
}

impl ActivityClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify(&self, event: &SignalEvent) -> ActivityJudgment {
        if let Some(method) = event.normalized_method() {
            return self.classify_method(&method, event.http_uri.as_deref());
        }
        if let Some(bytes) = event.byte_size {
            if let Some(judgment) = self.classify_bytes(bytes) {
                return judgment;
            }
        }
        match event.kind {
            SignalKind::ProcessExec => {
                ActivityJudgment::user(ConfidenceSource::Policy, ActivityReason::ProcessLaunch)
            }
            SignalKind::ProcessingStart | SignalKind::ProcessingEnd => {
                ActivityJudgment::user(ConfidenceSource::Hook, ActivityReason::ProcessingBoundary)
            }
            _ if event.byte_size.is_some() => {
                ActivityJudgment::inconclusive(ActivityReason::AmbiguousSize)
            }
            _ => ActivityJudgment::inconclusive(ActivityReason::NoEvidence),
        }
    }

    fn classify_method(&self, method: &str, uri: Option<&str>) -> ActivityJudgment {
        let path = uri.map(normalize_path);
        let path = path.as_deref();

        if path.is_some_and(|path| self.is_background_endpoint(path)) {
            return ActivityJudgment::background(
                ConfidenceSource::HttpMethod,
                ActivityReason::BackgroundEndpoint,
            );
        }

        match method {
            "POST" | "PUT" | "PATCH" => {
                ActivityJudgment::user(ConfidenceSource::HttpMethod, ActivityReason::WriteMethod)
            }
            "GET" => {
                if path.is_some_and(|path| self.is_interactive_endpoint(path)) {
                    ActivityJudgment::user(
                        ConfidenceSource::HttpMethod,
                        ActivityReason::InteractiveGet,
                    )
                } else {
                    ActivityJudgment::background(
                        ConfidenceSource::HttpMethod,
                        ActivityReason::NonInteractiveGet,
                    )
                }
            }
            "OPTIONS" | "HEAD" => ActivityJudgment::background(
                ConfidenceSource::HttpMethod,
                ActivityReason::ProbeMethod,
            ),
            _ => ActivityJudgment::background(
                ConfidenceSource::HttpMethod,
                ActivityReason::OtherMethod,
            ),
        }
    }

    fn classify_bytes(&self, bytes: u64) -> Option<ActivityJudgment> {
        let config = &self.config;
        if bytes >= config.burst_min_bytes {
            Some(ActivityJudgment::user(
                ConfidenceSource::ByteHeuristic,
                ActivityReason::Burst,
            ))
        } else if bytes > config.interactive_min_bytes {
            Some(ActivityJudgment::user(
                ConfidenceSource::ByteHeuristic,
                ActivityReason::Interactive,
            ))
        } else if bytes < config.keepalive_max_bytes {
            Some(ActivityJudgment::background(
                ConfidenceSource::ByteHeuristic,
                ActivityReason::Keepalive,
            ))
        } else {
            None
        }
    }

    fn is_background_endpoint(&self, path: &str) -> bool {
        RE_HEALTH_ENDPOINT.is_match(path) || matches_any(path, &self.config.background_endpoints)
    }

    fn is_interactive_endpoint(&self, path: &str) -> bool {
        matches_any(path, &self.config.interactive_endpoints)
    }
}

/// Strips query/fragment, collapses duplicate slashes and drops a trailing slash.
fn normalize_path(uri: &str) -> String {
    let path = uri
        .trim()
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let collapsed = RE_REPEATED_SLASHES.replace_all(path, "/");
    let trimmed = collapsed.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

fn matches_any(path: &str, endpoints: &[String]) -> bool {
    endpoints.iter().any(|endpoint| {
        let endpoint = normalize_path(endpoint);
        path == endpoint
            || path
                .strip_prefix(endpoint.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}
