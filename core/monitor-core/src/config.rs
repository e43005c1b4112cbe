//! Runtime configuration for the monitor.
//!
//! Every field has a default so a partial (or missing) config file is valid.
//! The daemon deserializes this from `~/.claude-monitor/config.toml`; this
//! module only defines the shape, defaults and cross-field validation.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_SESSION_DURATION_SECS: i64 = 5 * 60 * 60;
pub const DEFAULT_IDLE_THRESHOLD_SECS: i64 = 5 * 60;
pub const DEFAULT_PROCESSING_CEILING_SECS: i64 = 20 * 60;
pub const DEFAULT_MAX_WORK_BLOCK_SECS: i64 = 12 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 45;
pub const DEFAULT_MAX_FUTURE_SKEW_SECS: i64 = 5 * 60;
/// Upper bound for every tracking duration, and for the work block cap.
pub const MAX_WORK_BLOCK_LIMIT_SECS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracking.validate()?;
        self.classifier.validate()?;
        self.persistence.validate()?;
        if self.scanner.enabled && self.scanner.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "scanner.interval_secs",
                "must be greater than zero when the scanner is enabled",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingConfig {
    #[serde(default = "default_session_duration_secs")]
    pub session_duration_secs: i64,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: i64,
    #[serde(default = "default_processing_ceiling_secs")]
    pub processing_ceiling_secs: i64,
    #[serde(default = "default_max_work_block_secs")]
    pub max_work_block_secs: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Signals stamped further ahead of the daemon clock than this are rejected.
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: i64,
    #[serde(default)]
    pub default_user_id: Option<String>,
    #[serde(default = "default_project")]
    pub default_project: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            session_duration_secs: default_session_duration_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            processing_ceiling_secs: default_processing_ceiling_secs(),
            max_work_block_secs: default_max_work_block_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_future_skew_secs: default_max_future_skew_secs(),
            default_user_id: None,
            default_project: default_project(),
        }
    }
}

impl TrackingConfig {
    // The accessors fall back to the default when a value is outside what
    // `chrono::Duration` can hold; `validate` rejects such values first.
    pub fn session_duration(&self) -> Duration {
        seconds_or(self.session_duration_secs, DEFAULT_SESSION_DURATION_SECS)
    }

    pub fn idle_threshold(&self) -> Duration {
        seconds_or(self.idle_threshold_secs, DEFAULT_IDLE_THRESHOLD_SECS)
    }

    pub fn processing_ceiling(&self) -> Duration {
        seconds_or(self.processing_ceiling_secs, DEFAULT_PROCESSING_CEILING_SECS)
    }

    pub fn max_work_block(&self) -> Duration {
        seconds_or(self.max_work_block_secs, DEFAULT_MAX_WORK_BLOCK_SECS)
    }

    pub fn max_future_skew(&self) -> Duration {
        seconds_or(self.max_future_skew_secs, DEFAULT_MAX_FUTURE_SKEW_SECS)
    }

    /// User attributed to signals that carry no user id.
    ///
    /// Falls back to `$USER`, then to `"default"`.
    pub fn resolve_default_user(&self) -> String {
        self.default_user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                std::env::var("USER")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            })
            .unwrap_or_else(|| "default".to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("tracking.session_duration_secs", self.session_duration_secs),
            ("tracking.idle_threshold_secs", self.idle_threshold_secs),
            ("tracking.processing_ceiling_secs", self.processing_ceiling_secs),
            ("tracking.max_work_block_secs", self.max_work_block_secs),
        ] {
            if value <= 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
            if value > MAX_WORK_BLOCK_LIMIT_SECS {
                return Err(ConfigError::invalid(field, "must not exceed 7 days"));
            }
        }
        if self.max_work_block_secs < self.session_duration_secs {
            return Err(ConfigError::invalid(
                "tracking.max_work_block_secs",
                "must be at least the session duration",
            ));
        }
        if !(0..=MAX_WORK_BLOCK_LIMIT_SECS).contains(&self.max_future_skew_secs) {
            return Err(ConfigError::invalid(
                "tracking.max_future_skew_secs",
                "must be between zero and 7 days",
            ));
        }
        if self.default_project.trim().is_empty() {
            return Err(ConfigError::invalid(
                "tracking.default_project",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

fn seconds_or(secs: i64, fallback: i64) -> Duration {
    Duration::try_seconds(secs)
        .or_else(|| Duration::try_seconds(fallback))
        .unwrap_or_else(Duration::zero)
}

/// Byte thresholds and endpoint lists used by the activity classifier.
///
/// Boundaries: `< keepalive_max_bytes` is keepalive, `> interactive_min_bytes`
/// is interactive, `>= burst_min_bytes` is burst. Sizes in between are inconclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    #[serde(default = "default_keepalive_max_bytes")]
    pub keepalive_max_bytes: u64,
    #[serde(default = "default_interactive_min_bytes")]
    pub interactive_min_bytes: u64,
    #[serde(default = "default_burst_min_bytes")]
    pub burst_min_bytes: u64,
    #[serde(default = "default_interactive_endpoints")]
    pub interactive_endpoints: Vec<String>,
    #[serde(default = "default_background_endpoints")]
    pub background_endpoints: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            keepalive_max_bytes: default_keepalive_max_bytes(),
            interactive_min_bytes: default_interactive_min_bytes(),
            burst_min_bytes: default_burst_min_bytes(),
            interactive_endpoints: default_interactive_endpoints(),
            background_endpoints: default_background_endpoints(),
        }
    }
}

impl ClassifierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interactive_min_bytes < self.keepalive_max_bytes {
            return Err(ConfigError::invalid(
                "classifier.interactive_min_bytes",
                "must not be below keepalive_max_bytes",
            ));
        }
        if self.burst_min_bytes <= self.interactive_min_bytes {
            return Err(ConfigError::invalid(
                "classifier.burst_min_bytes",
                "must be above interactive_min_bytes",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PersistenceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "persistence.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scanner_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scanner_enabled(),
            interval_secs: default_scanner_interval_secs(),
            process_names: default_process_names(),
        }
    }
}

fn default_session_duration_secs() -> i64 {
    DEFAULT_SESSION_DURATION_SECS
}

fn default_idle_threshold_secs() -> i64 {
    DEFAULT_IDLE_THRESHOLD_SECS
}

fn default_processing_ceiling_secs() -> i64 {
    DEFAULT_PROCESSING_CEILING_SECS
}

fn default_max_work_block_secs() -> i64 {
    DEFAULT_MAX_WORK_BLOCK_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_max_future_skew_secs() -> i64 {
    DEFAULT_MAX_FUTURE_SKEW_SECS
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_keepalive_max_bytes() -> u64 {
    100
}

fn default_interactive_min_bytes() -> u64 {
    200
}

fn default_burst_min_bytes() -> u64 {
    2048
}

fn default_interactive_endpoints() -> Vec<String> {
    vec![
        "/v1/messages".to_string(),
        "/v1/conversation".to_string(),
        "/v1/complete".to_string(),
    ]
}

fn default_background_endpoints() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/status".to_string(),
        "/v1/status".to_string(),
    ]
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_step_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_scanner_enabled() -> bool {
    true
}

fn default_scanner_interval_secs() -> u64 {
    10
}

fn default_process_names() -> Vec<String> {
    vec!["claude".to_string()]
}
