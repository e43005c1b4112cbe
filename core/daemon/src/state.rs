//! In-memory state managed by the daemon.
//!
//! The tracker is authoritative; SQLite is written behind it by the
//! background persistence writer.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use claude_monitor_protocol::{ErrorInfo, SignalEnvelope, SignalType};
use monitor_core::{
    ActivityStore, ActivityTracker, BackgroundPersist, ContextKey, IngestOutcome, JudgmentStats,
    MonitorConfig, PersistHealthSnapshot, PersistSink, RetryPolicy, Session, SessionState,
    SignalEvent, SignalKind, TrackerError, TrackerSnapshot, WorkBlock, WorkSummary,
};
use monitor_core::time_validation::is_valid_time;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::db::Db;

const RECENT_EVENT_CAPACITY: usize = 1024;

pub struct SharedState {
    tracker: ActivityTracker,
    persist: Arc<BackgroundPersist>,
    recent_events: Mutex<RecentEventIds>,
    started_at: DateTime<Utc>,
}

/// Bounded memory of accepted event ids, used to drop client retries.
#[derive(Default)]
struct RecentEventIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentEventIds {
    fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    fn insert(&mut self, event_id: &str) {
        if !self.seen.insert(event_id.to_string()) {
            return;
        }
        self.order.push_back(event_id.to_string());
        while self.order.len() > RECENT_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionView {
    #[serde(flatten)]
    pub session: Session,
    pub state: SessionState,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenBlockView {
    #[serde(flatten)]
    pub block: WorkBlock,
    pub elapsed_seconds: i64,
    pub processing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: WorkSummary,
    pub headline: String,
    pub efficiency_label: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub default_user: String,
    pub open_work_blocks: usize,
    pub known_sessions: usize,
    pub classification: JudgmentStats,
    pub persistence: PersistHealthSnapshot,
}

impl SharedState {
    pub fn new(db: Db, config: MonitorConfig) -> Result<Self, String> {
        let store: Arc<dyn ActivityStore> = Arc::new(db);
        let persist = Arc::new(BackgroundPersist::spawn(
            Arc::clone(&store),
            RetryPolicy::from_config(&config.persistence),
        )?);
        let sink: Arc<dyn PersistSink> = persist.clone();
        let tracker = ActivityTracker::new(config, store, sink);

        match tracker.recover(Utc::now()) {
            Ok(restored) => {
                tracing::info!(restored, "Restored open work blocks from storage");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to recover open work blocks");
            }
        }

        Ok(Self {
            tracker,
            persist,
            recent_events: Mutex::new(RecentEventIds::default()),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        self.tracker.config()
    }

    pub fn ingest(&self, event: &SignalEvent) -> Result<IngestOutcome, TrackerError> {
        let outcome = self.tracker.ingest(event)?;
        match &outcome {
            IngestOutcome::Recorded {
                session,
                block,
                session_started,
                closed,
            } => {
                if *session_started {
                    tracing::info!(
                        session_id = %session.id,
                        user_id = %session.user_id,
                        start = %session.start_time,
                        end = %session.end_time,
                        "Session started"
                    );
                }
                for closed_block in closed {
                    tracing::info!(
                        block_id = %closed_block.id,
                        project = %closed_block.project,
                        duration_seconds = ?closed_block.duration_seconds,
                        reason = ?closed_block.close_reason,
                        "Work block closed"
                    );
                }
                tracing::debug!(
                    block_id = %block.id,
                    project = %block.project,
                    activity_count = block.activity_count,
                    "Work block updated"
                );
            }
            IngestOutcome::LateSignal => {
                tracing::debug!(kind = %event.kind, at = %event.timestamp, "Late signal ignored");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Ingests a client signal once per event id. Returns `None` for a replay.
    pub fn ingest_signal(
        &self,
        event_id: &str,
        event: &SignalEvent,
    ) -> Result<Option<IngestOutcome>, TrackerError> {
        let mut recent = self
            .recent_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if recent.contains(event_id) {
            tracing::debug!(event_id, "Duplicate signal ignored");
            return Ok(None);
        }
        let outcome = self.ingest(event)?;
        recent.insert(event_id);
        Ok(Some(outcome))
    }

    pub fn sweep(&self) -> Vec<WorkBlock> {
        self.tracker.sweep(Utc::now())
    }

    pub fn flush(&self) -> Vec<WorkBlock> {
        self.tracker.flush()
    }

    /// Flushes open blocks and stops the persistence writer once its queue drains.
    pub fn shutdown(&self) {
        let closed = self.flush();
        tracing::info!(closed = closed.len(), "Flushed work blocks for shutdown");
        self.persist.shutdown();
    }

    pub fn active_session(
        &self,
        user_id: Option<&str>,
    ) -> Result<Option<ActiveSessionView>, String> {
        let now = Utc::now();
        let user_id = match user_id.map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => self.tracker.default_user(),
        };
        let session = self
            .tracker
            .active_session(user_id, now)
            .map_err(|err| err.to_string())?;
        Ok(session.map(|session| ActiveSessionView {
            state: session.state_at(now),
            remaining_seconds: session.remaining_at(now).num_seconds(),
            session,
        }))
    }

    pub fn open_work_block(&self, session_id: &str, project: &str) -> Option<OpenBlockView> {
        let key = ContextKey::new(session_id, project);
        self.tracker
            .open_work_block(&key)
            .map(|block| self.block_view(block, Utc::now()))
    }

    pub fn open_work_blocks(&self) -> Vec<OpenBlockView> {
        let now = Utc::now();
        self.tracker
            .open_work_blocks()
            .into_iter()
            .map(|block| self.block_view(block, now))
            .collect()
    }

    /// Report for one local calendar day (today when `date` is `None`).
    pub fn summary_for(&self, date: Option<NaiveDate>) -> Result<DaySummary, String> {
        let date = date.unwrap_or_else(|| Local::now().date_naive());
        let (from, to) = local_day_bounds(date)?;
        let summary = self
            .tracker
            .summary_between(from, to)
            .map_err(|err| err.to_string())?;
        Ok(DaySummary {
            date,
            from,
            to,
            headline: summary.headline(),
            efficiency_label: summary.efficiency_label(),
            summary,
        })
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let TrackerSnapshot {
            open_work_blocks,
            known_sessions,
            stats,
            persistence,
        } = self.tracker.snapshot();
        HealthSnapshot {
            started_at: self.started_at,
            default_user: self.tracker.default_user().to_string(),
            open_work_blocks: open_work_blocks.len(),
            known_sessions,
            classification: stats,
            persistence,
        }
    }

    fn block_view(&self, block: WorkBlock, now: DateTime<Utc>) -> OpenBlockView {
        OpenBlockView {
            elapsed_seconds: block.duration_at(now),
            processing: self.tracker.is_processing(&block.context_key(), now),
            block,
        }
    }
}

/// Converts a validated wire envelope into a core signal.
pub fn signal_from_envelope(envelope: &SignalEnvelope) -> Result<SignalEvent, ErrorInfo> {
    let timestamp = DateTime::parse_from_rfc3339(&envelope.recorded_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ErrorInfo::new("invalid_timestamp", "recorded_at must be RFC3339"))?;
    if !is_valid_time(&timestamp) {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            "recorded_at is outside the supported range",
        ));
    }

    let kind = match envelope.signal_type {
        SignalType::ProcessExec => SignalKind::ProcessExec,
        SignalType::NetworkConnect => SignalKind::NetworkConnect,
        SignalType::HttpRequest => SignalKind::HttpRequest,
        SignalType::ProcessExit => SignalKind::ProcessExit,
        SignalType::ProcessingStart => SignalKind::ProcessingStart,
        SignalType::ProcessingProgress => SignalKind::ProcessingProgress,
        SignalType::ProcessingEnd => SignalKind::ProcessingEnd,
    };

    let mut event = SignalEvent::new(kind, timestamp);
    event.http_method = envelope.http_method.clone();
    event.http_uri = envelope.http_uri.clone();
    event.byte_size = envelope.byte_size;
    event.process_id = envelope.pid;
    event.process_name = envelope.process_name.clone();
    event.user_id = non_blank(&envelope.user_id);
    event.project = non_blank(&envelope.project);
    event.prompt_id = non_blank(&envelope.prompt_id);
    Ok(event)
}

/// Response payload describing what a signal did.
pub fn outcome_json(outcome: &IngestOutcome) -> Value {
    match outcome {
        IngestOutcome::NotActivity(judgment) => json!({
            "accepted": true,
            "outcome": "not_activity",
            "background": judgment.is_background,
            "source": judgment.source.as_str(),
            "reason": judgment.reason.to_string(),
        }),
        IngestOutcome::ProcessingTouched { refreshed } => json!({
            "accepted": true,
            "outcome": "processing_touched",
            "refreshed": refreshed,
        }),
        IngestOutcome::LateSignal => json!({"accepted": true, "outcome": "late_signal"}),
        IngestOutcome::OutOfOrder => json!({"accepted": true, "outcome": "out_of_order"}),
        IngestOutcome::InvalidTime => json!({"accepted": false, "outcome": "invalid_time"}),
        IngestOutcome::Recorded {
            session,
            block,
            session_started,
            closed,
        } => json!({
            "accepted": true,
            "outcome": "recorded",
            "session_id": session.id,
            "work_block_id": block.id,
            "session_started": session_started,
            "closed_work_blocks": closed.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
        }),
    }
}

fn local_day_bounds(date: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
    let next = date
        .succ_opt()
        .ok_or_else(|| format!("No day follows {}", date))?;
    Ok((local_midnight(date)?, local_midnight(next)?))
}

fn local_midnight(date: NaiveDate) -> Result<DateTime<Utc>, String> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("Invalid midnight for {}", date))?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("Local midnight does not exist for {}", date))
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state() -> (tempfile::TempDir, SharedState) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db");
        let mut config = MonitorConfig::default();
        config.tracking.default_user_id = Some("sam".to_string());
        let state = SharedState::new(db, config).expect("state");
        (temp_dir, state)
    }

    fn envelope(signal_type: SignalType, recorded_at: DateTime<Utc>) -> SignalEnvelope {
        let mut envelope =
            SignalEnvelope::new("evt-1", recorded_at.to_rfc3339(), signal_type);
        envelope.project = Some("api".to_string());
        envelope
    }

    #[test]
    fn converts_envelope_fields() {
        let at = Utc::now();
        let mut wire = envelope(SignalType::HttpRequest, at);
        wire.http_method = Some("post".to_string());
        wire.http_uri = Some("/v1/messages".to_string());
        wire.byte_size = Some(12);
        wire.user_id = Some("  ".to_string());

        let event = signal_from_envelope(&wire).expect("convert");
        assert_eq!(event.kind, SignalKind::HttpRequest);
        assert_eq!(event.normalized_method().as_deref(), Some("POST"));
        assert_eq!(event.byte_size, Some(12));
        assert_eq!(event.project.as_deref(), Some("api"));
        assert!(event.user_id.is_none());
    }

    #[test]
    fn rejects_out_of_range_timestamps() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let far_future = Utc.with_ymd_and_hms(2999, 6, 1, 12, 0, 0).unwrap();
        for at in [epoch, far_future] {
            let err = signal_from_envelope(&envelope(SignalType::HttpRequest, at))
                .expect_err("implausible timestamp accepted");
            assert_eq!(err.code, "invalid_timestamp");
        }
    }

    #[test]
    fn clock_skewed_signal_is_not_recorded() {
        let (_dir, state) = temp_state();
        let ahead = Utc::now() + chrono::Duration::hours(2);
        let event = signal_from_envelope(&envelope(SignalType::ProcessingStart, ahead))
            .expect("convert");
        let json = outcome_json(&state.ingest(&event).expect("ingest"));
        assert_eq!(json["outcome"], "invalid_time");
        assert_eq!(json["accepted"], false);
        assert!(state.active_session(None).expect("lookup").is_none());
        assert!(state.open_work_blocks().is_empty());
        state.flush();
        assert_eq!(state.health_snapshot().persistence.written, 0);
    }

    #[test]
    fn recorded_signal_is_visible_and_flushes_to_storage() {
        let (_dir, state) = temp_state();
        let now = Utc::now();
        let event = signal_from_envelope(&envelope(SignalType::ProcessingStart, now))
            .expect("convert");
        let outcome = state.ingest(&event).expect("ingest");
        let json = outcome_json(&outcome);
        assert_eq!(json["outcome"], "recorded");
        assert_eq!(json["session_started"], true);

        let session = state
            .active_session(None)
            .expect("lookup")
            .expect("active session");
        assert_eq!(session.session.user_id, "sam");
        assert_eq!(session.state, SessionState::Active);

        let open = state.open_work_blocks();
        assert_eq!(open.len(), 1);
        assert!(open[0].processing);
        assert!(state
            .open_work_block(&session.session.id, "api")
            .is_some());

        let closed = state.flush();
        assert_eq!(closed.len(), 1);
        assert!(state.open_work_blocks().is_empty());
        // create session, open block, session bookkeeping, closed block
        assert_eq!(state.health_snapshot().persistence.written, 4);
    }

    #[test]
    fn replayed_event_id_is_ingested_once() {
        let (_dir, state) = temp_state();
        let wire = envelope(SignalType::ProcessingStart, Utc::now());
        let event = signal_from_envelope(&wire).expect("convert");

        assert!(state.ingest_signal(&wire.event_id, &event).expect("first").is_some());
        assert!(state.ingest_signal(&wire.event_id, &event).expect("replay").is_none());

        let session = state
            .active_session(None)
            .expect("lookup")
            .expect("active session");
        assert_eq!(session.session.activity_count, 1);
    }

    #[test]
    fn recent_event_ids_are_bounded() {
        let mut recent = RecentEventIds::default();
        for index in 0..=RECENT_EVENT_CAPACITY {
            recent.insert(&format!("evt-{}", index));
        }
        assert!(!recent.contains("evt-0"));
        assert!(recent.contains("evt-1"));
        assert_eq!(recent.order.len(), RECENT_EVENT_CAPACITY);
    }

    #[test]
    fn background_signal_reports_reason() {
        let (_dir, state) = temp_state();
        let mut wire = envelope(SignalType::HttpRequest, Utc::now());
        wire.http_method = Some("GET".to_string());
        wire.http_uri = Some("/health".to_string());
        let event = signal_from_envelope(&wire).expect("convert");
        let json = outcome_json(&state.ingest(&event).expect("ingest"));
        assert_eq!(json["outcome"], "not_activity");
        assert_eq!(json["background"], true);
        assert!(state.active_session(Some("sam")).expect("lookup").is_none());
    }

    #[test]
    fn day_bounds_span_one_local_day() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).expect("date");
        let (from, to) = local_day_bounds(date).expect("bounds");
        let hours = (to - from).num_hours();
        assert!((23..=25).contains(&hours), "unexpected span {}h", hours);
    }

    #[test]
    fn empty_summary_for_quiet_day() {
        let (_dir, state) = temp_state();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).expect("date");
        let summary = state.summary_for(Some(date)).expect("summary");
        assert_eq!(summary.summary.block_count, 0);
        assert_eq!(summary.efficiency_label, "Consider longer focus blocks");
    }
}
