use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use monitor_core::{
    ActivityStore, ActivityTracker, CloseReason, ContextKey, IngestOutcome, InlinePersist,
    MemoryStore, MonitorConfig, SignalEvent, SignalKind, WorkBlock,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap()
}

fn tracker() -> (ActivityTracker, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let persist = Arc::new(InlinePersist::new(store.clone()));
    let mut config = MonitorConfig::default();
    config.tracking.default_user_id = Some("dev".to_string());
    (ActivityTracker::new(config, store.clone(), persist), store)
}

fn post(at: DateTime<Utc>, bytes: u64) -> SignalEvent {
    SignalEvent::http_request(at, Some("POST"), Some("/v1/messages"), Some(bytes))
}

fn closed_blocks(store: &MemoryStore) -> Vec<WorkBlock> {
    store
        .all_work_blocks()
        .into_iter()
        .filter(|block| !block.is_open())
        .collect()
}

#[test]
fn idle_gap_splits_blocks_and_health_checks_are_ignored() {
    let (tracker, store) = tracker();

    tracker
        .ingest(&SignalEvent::process_exec(t0(), 4242, "claude"))
        .expect("exec");
    tracker
        .ingest(&post(t0() + Duration::minutes(1), 200))
        .expect("post 1");
    tracker
        .ingest(&post(t0() + Duration::minutes(3), 10))
        .expect("tiny post still counts");

    let health = SignalEvent::http_request(
        t0() + Duration::minutes(10),
        Some("GET"),
        Some("/health"),
        Some(64),
    );
    assert!(matches!(
        tracker.ingest(&health).expect("health"),
        IngestOutcome::NotActivity(_)
    ));
    assert!(closed_blocks(&store).is_empty(), "health check must not close anything");

    let outcome = tracker
        .ingest(&post(t0() + Duration::minutes(10) + Duration::seconds(30), 900))
        .expect("post 3");

    let (session, opened, closed) = match outcome {
        IngestOutcome::Recorded {
            session,
            block,
            closed,
            ..
        } => (session, block, closed),
        other => panic!("expected Recorded, got {:?}", other),
    };

    assert_eq!(closed.len(), 1);
    let first = &closed[0];
    assert_eq!(first.start_time, t0());
    assert_eq!(first.end_time, Some(t0() + Duration::minutes(3)));
    assert_eq!(first.duration_seconds, Some(180));
    assert_eq!(first.activity_count, 3);
    assert_eq!(first.close_reason, Some(CloseReason::IdleTimeout));

    assert_eq!(opened.start_time, t0() + Duration::minutes(10) + Duration::seconds(30));
    assert_eq!(opened.activity_count, 1);
    assert!(opened.is_open());

    // Storage reflects the same decisions.
    let stored_closed = closed_blocks(&store);
    assert_eq!(stored_closed.len(), 1);
    assert_eq!(stored_closed[0].id, first.id);
    let key = ContextKey::new(session.id.clone(), "default");
    assert_eq!(
        store.find_open_work_block(&key).expect("lookup").map(|b| b.id),
        Some(opened.id.clone())
    );
    assert_eq!(tracker.open_work_block(&key).map(|b| b.id), Some(opened.id));
    assert_eq!(session.activity_count, 4);
}

#[test]
fn processing_window_bridges_long_claude_turn() {
    let (tracker, store) = tracker();

    tracker
        .ingest(&SignalEvent::processing(SignalKind::ProcessingStart, t0()))
        .expect("start");
    tracker
        .ingest(&SignalEvent::processing(
            SignalKind::ProcessingProgress,
            t0() + Duration::minutes(6),
        ))
        .expect("progress");
    let outcome = tracker
        .ingest(&SignalEvent::processing(
            SignalKind::ProcessingEnd,
            t0() + Duration::minutes(12),
        ))
        .expect("end");

    let block = match outcome {
        IngestOutcome::Recorded { block, closed, .. } => {
            assert!(closed.is_empty(), "no spurious split");
            block
        }
        other => panic!("expected Recorded, got {:?}", other),
    };
    assert_eq!(block.start_time, t0());
    assert_eq!(block.last_activity_time, t0() + Duration::minutes(12));
    assert_eq!(block.claude_processing_seconds, 12 * 60);

    let flushed = tracker.flush();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].duration_seconds, Some(12 * 60));
    assert_eq!(store.all_work_blocks().len(), 1);
}

#[test]
fn sweep_respects_processing_then_closes_after_ceiling() {
    let (tracker, _store) = tracker();
    tracker
        .ingest(&SignalEvent::processing(SignalKind::ProcessingStart, t0()))
        .expect("start");

    assert!(tracker.sweep(t0() + Duration::minutes(15)).is_empty());

    // The end hook never arrives.
    let closed = tracker.sweep(t0() + Duration::minutes(25));
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].end_time, Some(t0()));
    assert_eq!(closed[0].close_reason, Some(CloseReason::Sweep));
}

#[test]
fn concurrent_first_activity_creates_one_session() {
    let (tracker, store) = tracker();
    let tracker = Arc::new(tracker);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let event = post(t0() + Duration::seconds(i), 500);
                tracker.ingest(&event).map(|_| ())
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join().expect("thread");
    }

    let sessions = store.sessions_for_user("dev");
    assert_eq!(sessions.len(), 1);
    assert_eq!(tracker.open_work_blocks().len(), 1);
}

#[test]
fn sessions_stay_disjoint_across_a_long_day() {
    let (tracker, store) = tracker();
    let mut at = t0();
    for _ in 0..60 {
        tracker.ingest(&post(at, 500)).expect("ingest");
        at += Duration::minutes(17);
    }
    // A clock hiccup in the middle of the day.
    let _ = tracker.ingest(&post(t0() + Duration::hours(6), 500));

    let sessions = store.sessions_for_user("dev");
    assert!(sessions.len() >= 3);
    for pair in sessions.windows(2) {
        assert_eq!(pair[0].end_time - pair[0].start_time, Duration::hours(5));
        assert!(pair[0].end_time <= pair[1].start_time);
    }

    tracker.flush();
    for block in store.all_work_blocks() {
        let seconds = block.duration_seconds.expect("closed");
        assert!((0..=43_200).contains(&seconds));
        let session = sessions
            .iter()
            .find(|s| s.id == block.session_id)
            .expect("owning session");
        assert!(block.start_time >= session.start_time);
        assert!(block.end_time.expect("closed") <= session.end_time);
    }
}
