//! Compiled regex patterns for request path classification.
//!
//! Compiled once on first use and shared by every classifier instance.

use once_cell::sync::Lazy;
use regex::Regex;

/// Health/status-style probe paths, optionally version-prefixed (`/v1/status`).
pub static RE_HEALTH_ENDPOINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:/v\d+)?/(?:health|healthz|status|ping)/?$").expect("valid health regex")
});

/// Collapses repeated slashes so `//v1//messages` matches `/v1/messages`.
pub static RE_REPEATED_SLASHES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/{2,}").expect("valid slash regex"));
