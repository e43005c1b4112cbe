//! The coordinator: one place where signals become sessions and work blocks.
//!
//! All mutable state lives in a single [`TrackerState`] behind one mutex. Live
//! ingestion, the periodic sweep and the shutdown flush all take that lock, so
//! two signals for the same user never race and every decision sees the state
//! left by the previous one.
//!
//! Persistence is fire-and-forget through the [`PersistSink`]: the in-memory
//! transition is the decision of record. Storage is only *read* on a cold cache
//! (first lookup of a user's session or of a context's open block), and only
//! those reads can fail ingestion.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classifier::{ActivityClassifier, ActivityJudgment};
use crate::config::MonitorConfig;
use crate::error::{StoreError, TrackerError};
use crate::idle::IdleTracker;
use crate::persist::{PersistHealthSnapshot, PersistOp, PersistSink};
use crate::session::{Session, SessionManager, SessionResolution};
use crate::signal::{ContextKey, SignalEvent, SignalKind};
use crate::store::ActivityStore;
use crate::summary::WorkSummary;
use crate::time_validation::is_valid_time;
use crate::workblock::{finalize, BlockOutcome, CloseReason, WorkBlock, WorkBlockManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Background or inconclusive; no state was touched.
    NotActivity(ActivityJudgment),
    /// A progress hook. `refreshed` is false when no processing window was open.
    ProcessingTouched { refreshed: bool },
    /// The signal predates the user's current session and would overlap it.
    LateSignal,
    /// The signal predates the context's last activity.
    OutOfOrder,
    /// The timestamp is implausible or too far ahead of the local clock.
    InvalidTime,
    Recorded {
        session: Session,
        block: WorkBlock,
        session_started: bool,
        /// Blocks closed by this signal (idle split or session rollover).
        closed: Vec<WorkBlock>,
    },
}

/// Classification counters, reported by the daemon's health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JudgmentStats {
    pub total: u64,
    pub user_activity: u64,
    pub background: u64,
    pub inconclusive: u64,
    pub late_signals: u64,
    pub out_of_order: u64,
    pub invalid_time: u64,
    pub by_source: BTreeMap<String, u64>,
    pub by_method: BTreeMap<String, u64>,
}

impl JudgmentStats {
    fn record(&mut self, event: &SignalEvent, judgment: &ActivityJudgment) {
        self.total += 1;
        if judgment.is_user_activity {
            self.user_activity += 1;
        } else if judgment.is_background {
            self.background += 1;
        } else {
            self.inconclusive += 1;
        }
        *self
            .by_source
            .entry(judgment.source.as_str().to_string())
            .or_default() += 1;
        if event.kind == SignalKind::HttpRequest {
            let method = event
                .normalized_method()
                .unwrap_or_else(|| "NONE".to_string());
            *self.by_method.entry(method).or_default() += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub open_work_blocks: Vec<WorkBlock>,
    pub known_sessions: usize,
    pub stats: JudgmentStats,
    pub persistence: PersistHealthSnapshot,
}

struct TrackerState {
    sessions: SessionManager,
    blocks: WorkBlockManager,
    /// Contexts whose open block has already been looked up in storage.
    probed: HashSet<ContextKey>,
    stats: JudgmentStats,
}

pub struct ActivityTracker {
    config: MonitorConfig,
    default_user: String,
    classifier: ActivityClassifier,
    store: Arc<dyn ActivityStore>,
    persist: Arc<dyn PersistSink>,
    state: Mutex<TrackerState>,
}

impl ActivityTracker {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn ActivityStore>,
        persist: Arc<dyn PersistSink>,
    ) -> Self {
        let tracking = &config.tracking;
        let idle = IdleTracker::new(tracking.idle_threshold(), tracking.processing_ceiling());
        let state = TrackerState {
            sessions: SessionManager::new(tracking.session_duration()),
            blocks: WorkBlockManager::new(idle, tracking.max_work_block()),
            probed: HashSet::new(),
            stats: JudgmentStats::default(),
        };
        Self {
            default_user: tracking.resolve_default_user(),
            classifier: ActivityClassifier::new(config.classifier.clone()),
            config,
            store,
            persist,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    pub fn ingest(&self, event: &SignalEvent) -> Result<IngestOutcome, TrackerError> {
        let judgment = self.classifier.classify(event);
        let at = event.timestamp;
        let user_id = event.user_or(&self.default_user).to_string();
        let project = event
            .project_or(&self.config.tracking.default_project)
            .to_string();

        tracing::debug!(
            kind = %event.kind,
            source = judgment.source.as_str(),
            reason = %judgment.reason,
            user_activity = judgment.is_user_activity,
            background = judgment.is_background,
            method = event.http_method.as_deref().unwrap_or(""),
            uri = event.http_uri.as_deref().unwrap_or(""),
            bytes = event.byte_size,
            "Classified signal"
        );

        let horizon = Utc::now() + self.config.tracking.max_future_skew();
        if !is_valid_time(&at) || at > horizon {
            tracing::warn!(
                kind = %event.kind,
                timestamp = %at,
                user_id = %user_id,
                "Rejecting signal with implausible timestamp"
            );
            self.lock_state().stats.invalid_time += 1;
            return Ok(IngestOutcome::InvalidTime);
        }

        let mut state = self.lock_state();
        state.stats.record(event, &judgment);

        if event.kind == SignalKind::ProcessingProgress {
            let refreshed = match state.sessions.active_session(&user_id, at) {
                Some(session) => state
                    .blocks
                    .touch_processing(&ContextKey::new(session.id, project), at),
                None => false,
            };
            return Ok(IngestOutcome::ProcessingTouched { refreshed });
        }

        if !judgment.qualifies() {
            return Ok(IngestOutcome::NotActivity(judgment));
        }

        let resolution = state
            .sessions
            .get_or_create(&user_id, at, self.store.as_ref())
            .map_err(|source| TrackerError::SessionLookup {
                user_id: user_id.clone(),
                source,
            })?;

        let mut closed = Vec::new();
        let (session, session_started) = match resolution {
            SessionResolution::Existing(session) => (session, false),
            SessionResolution::Created { session, previous } => {
                self.persist.submit(PersistOp::CreateSession(session.clone()));
                if let Some(previous) = previous {
                    closed = state.blocks.close_session_blocks(&previous);
                    if !closed.is_empty() {
                        tracing::info!(
                            previous_session = %previous.id,
                            session_id = %session.id,
                            closed = closed.len(),
                            "Session rolled over; closed previous work blocks"
                        );
                    }
                }
                (session, true)
            }
            SessionResolution::Late { .. } => {
                state.stats.late_signals += 1;
                return Ok(IngestOutcome::LateSignal);
            }
        };

        let key = ContextKey::new(session.id.clone(), project.clone());
        if !session_started && !state.blocks.has_open(&key) && state.probed.insert(key.clone()) {
            let stored = self
                .store
                .find_open_work_block(&key)
                .map_err(|source| TrackerError::WorkBlockLookup {
                    context: key.to_string(),
                    source,
                });
            match stored {
                Ok(Some(block)) => state.blocks.restore(block, session.end_time),
                Ok(None) => {}
                Err(err) => {
                    state.probed.remove(&key);
                    self.persist_closed(&closed);
                    return Err(err);
                }
            }
        } else if session_started {
            state.probed.insert(key.clone());
        }

        let outcome = state.blocks.record(&session, &project, event.kind, at);
        let block = match outcome {
            BlockOutcome::Ignored => {
                state.stats.out_of_order += 1;
                self.persist_closed(&closed);
                return Ok(IngestOutcome::OutOfOrder);
            }
            BlockOutcome::Opened(block) | BlockOutcome::Extended(block) => block,
            BlockOutcome::Split {
                closed: split,
                opened,
            } => {
                tracing::info!(
                    block_id = %split.id,
                    context = %key,
                    duration_secs = split.duration_seconds.unwrap_or_default(),
                    "Work block closed after idle gap"
                );
                closed.push(split);
                opened
            }
        };

        let session = state
            .sessions
            .note_activity(&user_id, &session.id, at)
            .unwrap_or(session);
        drop(state);

        self.persist_closed(&closed);
        self.persist
            .submit(PersistOp::UpsertWorkBlock(block.clone()));
        self.persist
            .submit(PersistOp::UpdateSession(session.clone()));

        Ok(IngestOutcome::Recorded {
            session,
            block,
            session_started,
            closed,
        })
    }

    /// Loads open blocks left in storage by a previous run and re-adopts the
    /// ones whose session is known, then sweeps as of `now`.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let open = self.store.open_work_blocks()?;
        let mut restored = 0;
        let mut orphaned = Vec::new();
        {
            let mut state = self.lock_state();
            for mut block in open {
                match self.store.find_session(&block.session_id)? {
                    Some(session) => {
                        state.probed.insert(block.context_key());
                        state.sessions.remember(session.clone());
                        state.blocks.restore(block, session.end_time);
                        restored += 1;
                    }
                    None => {
                        tracing::warn!(
                            block_id = %block.id,
                            session_id = %block.session_id,
                            "Open work block has no stored session; closing at last activity"
                        );
                        let end = block.last_activity_time;
                        finalize(
                            &mut block,
                            end,
                            end,
                            self.config.tracking.max_work_block(),
                            CloseReason::Flush,
                        );
                        orphaned.push(block);
                    }
                }
            }
        }
        self.persist_closed(&orphaned);
        tracing::info!(restored, orphaned = orphaned.len(), "Recovered open work blocks");
        self.sweep(now);
        Ok(restored)
    }

    /// Closes blocks that went idle (or whose session ended) as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<WorkBlock> {
        let closed = {
            let mut state = self.lock_state();
            let closed = state.blocks.sweep(now);
            let TrackerState {
                sessions, probed, ..
            } = &mut *state;
            sessions.prune(now);
            probed.retain(|key| sessions.find(&key.session_id).is_some());
            closed
        };
        if !closed.is_empty() {
            tracing::info!(closed = closed.len(), "Sweep closed idle work blocks");
        }
        self.persist_closed(&closed);
        closed
    }

    /// Closes every open block at its last activity and waits for the writes.
    pub fn flush(&self) -> Vec<WorkBlock> {
        let closed = self.lock_state().blocks.flush();
        tracing::info!(closed = closed.len(), "Flushed open work blocks");
        self.persist_closed(&closed);
        self.persist.drain();
        closed
    }

    /// Session covering `now` for `user_id`. Reads storage on a cache miss but
    /// never creates anything.
    pub fn active_session(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        if let Some(session) = self.lock_state().sessions.active_session(user_id, now) {
            return Ok(Some(session));
        }
        self.store.find_active_session(user_id, now)
    }

    pub fn open_work_block(&self, key: &ContextKey) -> Option<WorkBlock> {
        self.lock_state().blocks.open_block(key).cloned()
    }

    pub fn open_work_blocks(&self) -> Vec<WorkBlock> {
        self.lock_state().blocks.open_blocks()
    }

    pub fn is_processing(&self, key: &ContextKey, now: DateTime<Utc>) -> bool {
        self.lock_state().blocks.is_processing(key, now)
    }

    pub fn stats(&self) -> JudgmentStats {
        self.lock_state().stats.clone()
    }

    pub fn persist_health(&self) -> PersistHealthSnapshot {
        self.persist.health().snapshot()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let (open_work_blocks, known_sessions, stats) = {
            let state = self.lock_state();
            (
                state.blocks.open_blocks(),
                state.sessions.known_sessions(),
                state.stats.clone(),
            )
        };
        TrackerSnapshot {
            open_work_blocks,
            known_sessions,
            stats,
            persistence: self.persist_health(),
        }
    }

    /// Report over closed blocks starting in `[from, to)`.
    pub fn summary_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WorkSummary, StoreError> {
        let blocks = self.store.work_blocks_between(from, to)?;
        Ok(WorkSummary::from_blocks(
            &blocks,
            self.config.tracking.max_work_block(),
        ))
    }

    fn persist_closed(&self, closed: &[WorkBlock]) {
        for block in closed {
            self.persist.submit(PersistOp::UpsertWorkBlock(block.clone()));
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        // A panic mid-transition leaves state that is still structurally valid.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InlinePersist;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()
    }

    fn config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.tracking.default_user_id = Some("alice".to_string());
        config
    }

    fn tracker_with(store: Arc<MemoryStore>) -> ActivityTracker {
        let persist = Arc::new(InlinePersist::new(store.clone()));
        ActivityTracker::new(config(), store, persist)
    }

    fn post(at: DateTime<Utc>, bytes: u64) -> SignalEvent {
        SignalEvent::http_request(at, Some("POST"), Some("/v1/messages"), Some(bytes))
    }

    fn recorded(outcome: IngestOutcome) -> (Session, WorkBlock, Vec<WorkBlock>) {
        match outcome {
            IngestOutcome::Recorded {
                session,
                block,
                closed,
                ..
            } => (session, block, closed),
            other => panic!("expected Recorded, got {:?}", other),
        }
    }

    #[test]
    fn background_signal_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let health = SignalEvent::http_request(t0(), Some("GET"), Some("/health"), Some(50_000));
        assert!(matches!(
            tracker.ingest(&health).expect("ingest"),
            IngestOutcome::NotActivity(_)
        ));
        assert!(store.sessions_for_user("alice").is_empty());
        assert!(tracker.open_work_blocks().is_empty());
        assert_eq!(tracker.stats().background, 1);
    }

    #[test]
    fn first_activity_creates_and_persists_session_and_block() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let (session, block, closed) =
            recorded(tracker.ingest(&post(t0(), 12)).expect("ingest"));
        assert!(closed.is_empty());
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.activity_count, 1);
        assert_eq!(block.session_id, session.id);
        assert_eq!(block.project, "default");

        let stored = store.sessions_for_user("alice");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].activity_count, 1);
        assert_eq!(store.all_work_blocks().len(), 1);
        assert_eq!(
            tracker.active_session("alice", t0()).expect("lookup"),
            Some(session)
        );
    }

    #[test]
    fn progress_without_processing_is_not_activity() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let progress = SignalEvent::processing(SignalKind::ProcessingProgress, t0());
        assert_eq!(
            tracker.ingest(&progress).expect("ingest"),
            IngestOutcome::ProcessingTouched { refreshed: false }
        );
        assert!(store.sessions_for_user("alice").is_empty());
    }

    #[test]
    fn session_rollover_closes_previous_blocks() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let (first, _, _) = recorded(tracker.ingest(&post(t0(), 500)).expect("ingest"));
        tracker
            .ingest(&post(first.end_time - Duration::minutes(1), 500))
            .expect("ingest");

        let (second, block, closed) = recorded(
            tracker
                .ingest(&post(first.end_time + Duration::minutes(2), 500))
                .expect("ingest"),
        );
        assert_ne!(second.id, first.id);
        assert_eq!(second.start_time, first.end_time + Duration::minutes(2));
        assert_eq!(block.session_id, second.id);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].end_time, Some(first.end_time));
        assert_eq!(closed[0].close_reason, Some(CloseReason::SessionBoundary));
    }

    #[test]
    fn implausible_timestamps_are_rejected_without_state() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let far_future = Utc.with_ymd_and_hms(2999, 1, 1, 9, 0, 0).unwrap();
        let ahead = Utc::now() + Duration::days(1);

        for at in [epoch, far_future, ahead] {
            assert_eq!(
                tracker.ingest(&post(at, 500)).expect("ingest"),
                IngestOutcome::InvalidTime,
                "{} accepted",
                at
            );
        }
        let progress = SignalEvent::processing(SignalKind::ProcessingStart, far_future);
        assert_eq!(
            tracker.ingest(&progress).expect("ingest"),
            IngestOutcome::InvalidTime
        );

        assert!(store.sessions_for_user("alice").is_empty());
        assert!(store.all_work_blocks().is_empty());
        assert!(tracker.open_work_blocks().is_empty());
        let stats = tracker.stats();
        assert_eq!(stats.invalid_time, 4);
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn rollover_still_closes_blocks_after_rejected_future_signal() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        let (first, _, _) = recorded(tracker.ingest(&post(t0(), 500)).expect("ingest"));
        tracker
            .ingest(&post(Utc.with_ymd_and_hms(2999, 1, 1, 9, 0, 0).unwrap(), 500))
            .expect("ingest");

        let (_, _, closed) = recorded(
            tracker
                .ingest(&post(first.end_time + Duration::minutes(30), 500))
                .expect("ingest"),
        );
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_id, first.id);
        assert!(tracker
            .open_work_blocks()
            .iter()
            .all(|block| block.session_id != first.id));
    }

    #[test]
    fn late_signal_is_counted_and_ignored() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        tracker.ingest(&post(t0(), 500)).expect("ingest");
        assert_eq!(
            tracker
                .ingest(&post(t0() - Duration::minutes(10), 500))
                .expect("ingest"),
            IngestOutcome::LateSignal
        );
        assert_eq!(tracker.stats().late_signals, 1);
        assert_eq!(store.sessions_for_user("alice").len(), 1);
    }

    #[test]
    fn cold_cache_read_failure_surfaces() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        store.set_unavailable(true);
        let err = tracker.ingest(&post(t0(), 500)).expect_err("store offline");
        assert!(matches!(err, TrackerError::SessionLookup { .. }));
    }

    #[test]
    fn write_failures_do_not_roll_back_decisions() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        tracker.ingest(&post(t0(), 500)).expect("ingest");
        store.set_unavailable(true);
        let (_, block, _) = recorded(
            tracker
                .ingest(&post(t0() + Duration::minutes(1), 500))
                .expect("cached session keeps ingestion alive"),
        );
        assert_eq!(block.activity_count, 2);
        assert!(tracker.persist_health().degraded);
    }

    #[test]
    fn restores_open_block_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let first = tracker_with(store.clone());
        let (_, block, _) = recorded(first.ingest(&post(t0(), 500)).expect("ingest"));
        drop(first);

        let second = tracker_with(store.clone());
        let restored = second
            .recover(t0() + Duration::minutes(2))
            .expect("recover");
        assert_eq!(restored, 1);
        let (_, continued, _) = recorded(
            second
                .ingest(&post(t0() + Duration::minutes(3), 500))
                .expect("ingest"),
        );
        assert_eq!(continued.id, block.id);
        assert_eq!(continued.activity_count, 2);
    }

    #[test]
    fn lazy_restore_on_cache_miss() {
        let store = Arc::new(MemoryStore::new());
        let first = tracker_with(store.clone());
        let (_, block, _) = recorded(first.ingest(&post(t0(), 500)).expect("ingest"));
        drop(first);

        let second = tracker_with(store);
        let (_, continued, _) = recorded(
            second
                .ingest(&post(t0() + Duration::minutes(4), 500))
                .expect("ingest"),
        );
        assert_eq!(continued.id, block.id);
    }

    #[test]
    fn sweep_and_flush_persist_closed_blocks() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone());
        tracker.ingest(&post(t0(), 500)).expect("ingest");
        tracker
            .ingest(&post(t0(), 500).with_project("docs"))
            .expect("ingest");
        tracker
            .ingest(&post(t0() + Duration::minutes(9), 500).with_project("docs"))
            .expect("ingest");

        let swept = tracker.sweep(t0() + Duration::minutes(10));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].project, "default");

        let flushed = tracker.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].project, "docs");
        assert!(store.all_work_blocks().iter().all(|block| !block.is_open()));
        assert!(tracker.open_work_blocks().is_empty());
    }

    #[test]
    fn stats_track_sources_and_methods() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store);
        tracker.ingest(&post(t0(), 10)).expect("ingest");
        tracker
            .ingest(&SignalEvent::http_request(t0(), None, None, Some(150)))
            .expect("ingest");
        tracker
            .ingest(&SignalEvent::process_exec(t0(), 1, "claude"))
            .expect("ingest");
        let stats = tracker.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.inconclusive, 1);
        assert_eq!(stats.by_source.get("http_method"), Some(&1));
        assert_eq!(stats.by_source.get("policy"), Some(&1));
        assert_eq!(stats.by_method.get("POST"), Some(&1));
        assert_eq!(stats.by_method.get("NONE"), Some(&1));
    }
}
