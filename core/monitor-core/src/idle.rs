//! Idle-gap detection per work context.
//!
//! Tracks the last qualifying activity for each [`ContextKey`] and decides
//! whether a new signal continues the current work block or starts a fresh one.
//!
//! A gap exactly equal to the threshold continues the block; only a strictly
//! larger gap starts a new one.
//!
//! While Claude is processing (a start hook with no matching end yet), idle
//! evaluation is suspended for that context. The suspension expires once no
//! start or progress signal has been seen for the processing ceiling, so a lost
//! end hook cannot hide idleness forever.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::signal::ContextKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    Continue,
    StartNew,
    /// The signal predates the tracked last activity; state was not touched.
    OutOfOrder,
}

#[derive(Debug, Clone, Copy)]
struct ProcessingWindow {
    started_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct ContextIdle {
    last_activity: DateTime<Utc>,
    processing: Option<ProcessingWindow>,
}

#[derive(Debug, Clone)]
pub struct IdleTracker {
    threshold: Duration,
    processing_ceiling: Duration,
    contexts: HashMap<ContextKey, ContextIdle>,
}

impl IdleTracker {
    pub fn new(threshold: Duration, processing_ceiling: Duration) -> Self {
        Self {
            threshold,
            processing_ceiling,
            contexts: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn evaluate(&mut self, key: &ContextKey, at: DateTime<Utc>) -> IdleDecision {
        let ceiling = self.processing_ceiling;
        let threshold = self.threshold;
        let Some(state) = self.contexts.get_mut(key) else {
            self.contexts.insert(
                key.clone(),
                ContextIdle {
                    last_activity: at,
                    processing: None,
                },
            );
            return IdleDecision::StartNew;
        };

        if at < state.last_activity {
            tracing::warn!(
                context = %key,
                signal_time = %at,
                last_activity = %state.last_activity,
                "Ignoring out-of-order signal"
            );
            return IdleDecision::OutOfOrder;
        }

        if let Some(window) = state.processing {
            if at - window.refreshed_at <= ceiling {
                state.last_activity = at;
                return IdleDecision::Continue;
            }
            tracing::warn!(
                context = %key,
                processing_started = %window.started_at,
                last_refresh = %window.refreshed_at,
                "Processing window exceeded ceiling; resuming idle detection"
            );
            state.processing = None;
        }

        let gap = at - state.last_activity;
        state.last_activity = at;
        if gap > threshold {
            IdleDecision::StartNew
        } else {
            IdleDecision::Continue
        }
    }

    /// Marks the context as processing. A repeated start keeps the original
    /// start time and only refreshes the ceiling.
    pub fn begin_processing(&mut self, key: &ContextKey, at: DateTime<Utc>) {
        let state = self.contexts.entry(key.clone()).or_insert(ContextIdle {
            last_activity: at,
            processing: None,
        });
        match state.processing.as_mut() {
            Some(window) => window.refreshed_at = window.refreshed_at.max(at),
            None => {
                state.processing = Some(ProcessingWindow {
                    started_at: at,
                    refreshed_at: at,
                })
            }
        }
    }

    /// Refreshes the ceiling of an in-flight processing window.
    ///
    /// Returns false when the context is not processing.
    pub fn touch_processing(&mut self, key: &ContextKey, at: DateTime<Utc>) -> bool {
        match self
            .contexts
            .get_mut(key)
            .and_then(|state| state.processing.as_mut())
        {
            Some(window) => {
                window.refreshed_at = window.refreshed_at.max(at);
                true
            }
            None => false,
        }
    }

    /// Ends processing and returns how long it lasted.
    pub fn end_processing(&mut self, key: &ContextKey, at: DateTime<Utc>) -> Option<Duration> {
        let window = self.contexts.get_mut(key)?.processing.take()?;
        Some((at - window.started_at).max(Duration::zero()))
    }

    pub fn is_processing(&self, key: &ContextKey, now: DateTime<Utc>) -> bool {
        self.contexts
            .get(key)
            .and_then(|state| state.processing)
            .is_some_and(|window| now - window.refreshed_at <= self.processing_ceiling)
    }

    /// True when `now` is past the idle threshold and no live processing window
    /// suspends detection. Does not mutate state.
    pub fn is_idle(&self, key: &ContextKey, now: DateTime<Utc>) -> bool {
        let Some(state) = self.contexts.get(key) else {
            return false;
        };
        if self.is_processing(key, now) {
            return false;
        }
        now - state.last_activity > self.threshold
    }

    pub fn last_activity(&self, key: &ContextKey) -> Option<DateTime<Utc>> {
        self.contexts.get(key).map(|state| state.last_activity)
    }

    /// Seeds state for a context restored from storage.
    pub fn seed(&mut self, key: &ContextKey, last_activity: DateTime<Utc>) {
        self.contexts.insert(
            key.clone(),
            ContextIdle {
                last_activity,
                processing: None,
            },
        );
    }

    pub fn forget(&mut self, key: &ContextKey) {
        self.contexts.remove(key);
    }

    pub fn tracked_contexts(&self) -> usize {
        self.contexts.len()
    }
}
