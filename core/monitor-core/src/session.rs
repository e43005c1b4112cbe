//! Fixed-length tracking sessions.
//!
//! A session is a window `[start_time, start_time + length)` anchored at the
//! first qualifying activity that found no covering session. Activeness is
//! always derived from the stored boundaries; nothing stores an "is active" flag.
//!
//! At most one session covers any instant for a given user. A signal that would
//! require an overlapping window (a clock that went backwards into the gap just
//! before an existing session) is reported as [`SessionResolution::Late`] and
//! does not create anything.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::ActivityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// `now` is outside the session window.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub activity_count: u64,
    pub first_activity_time: Option<DateTime<Utc>>,
    pub last_activity_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: &str, start_time: DateTime<Utc>, length: Duration) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            start_time,
            end_time: start_time + length,
            activity_count: 0,
            first_activity_time: None,
            last_activity_time: None,
        }
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start_time <= at && at < self.end_time
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if self.covers(now) {
            SessionState::Active
        } else {
            SessionState::Expired
        }
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end_time && self.start_time < end
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.end_time - now).max(Duration::zero())
    }

    fn note_activity(&mut self, at: DateTime<Utc>) {
        self.activity_count += 1;
        self.first_activity_time = Some(self.first_activity_time.map_or(at, |t| t.min(at)));
        self.last_activity_time = Some(self.last_activity_time.map_or(at, |t| t.max(at)));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResolution {
    /// A stored or cached session already covers the signal.
    Existing(Session),
    /// A new session was created. `previous` is the user's latest session that
    /// ended at or before the new start; its open work blocks must be closed.
    Created {
        session: Session,
        previous: Option<Session>,
    },
    /// The signal predates `current` and a window anchored at it would overlap.
    Late { current: Session },
}

impl SessionResolution {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionResolution::Existing(session) => Some(session),
            SessionResolution::Created { session, .. } => Some(session),
            SessionResolution::Late { .. } => None,
        }
    }
}

/// Per-user session index. Callers serialize access (the tracker holds it
/// behind its state lock), which makes lookup-then-create atomic per user.
#[derive(Debug, Clone)]
pub struct SessionManager {
    length: Duration,
    known: HashMap<String, BTreeMap<DateTime<Utc>, Session>>,
}

impl SessionManager {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            known: HashMap::new(),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn get_or_create(
        &mut self,
        user_id: &str,
        at: DateTime<Utc>,
        store: &dyn ActivityStore,
    ) -> Result<SessionResolution, StoreError> {
        if let Some(session) = self.cached_covering(user_id, at) {
            return Ok(SessionResolution::Existing(session));
        }

        if let Some(session) = store.find_active_session(user_id, at)? {
            self.remember(session.clone());
            return Ok(SessionResolution::Existing(session));
        }

        if let Some(next) = self.next_after(user_id, at, store)? {
            if next.overlaps(at, at + self.length) {
                tracing::warn!(
                    user_id,
                    signal_time = %at,
                    session_id = %next.id,
                    session_start = %next.start_time,
                    "Signal predates current session; ignoring to keep sessions disjoint"
                );
                return Ok(SessionResolution::Late { current: next });
            }
            let session = Session::new(user_id, at, self.length);
            tracing::warn!(
                user_id,
                signal_time = %at,
                session_id = %session.id,
                later_session_id = %next.id,
                "Clock anomaly: creating session anchored at earlier signal"
            );
            let previous = self.ended_by(user_id, at);
            self.remember(session.clone());
            return Ok(SessionResolution::Created { session, previous });
        }

        let previous = self.ended_by(user_id, at);
        let session = Session::new(user_id, at, self.length);
        tracing::info!(
            user_id,
            session_id = %session.id,
            start = %session.start_time,
            end = %session.end_time,
            "Session started"
        );
        self.remember(session.clone());
        Ok(SessionResolution::Created { session, previous })
    }

    /// Bookkeeping only; never moves a boundary. Returns the updated session.
    pub fn note_activity(
        &mut self,
        user_id: &str,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Option<Session> {
        let session = self
            .known
            .get_mut(user_id)?
            .values_mut()
            .find(|session| session.id == session_id)?;
        session.note_activity(at);
        Some(session.clone())
    }

    /// The session covering `now`, if this manager knows it.
    pub fn active_session(&self, user_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.cached_covering(user_id, now)
    }

    pub fn find(&self, session_id: &str) -> Option<Session> {
        self.known
            .values()
            .flat_map(|sessions| sessions.values())
            .find(|session| session.id == session_id)
            .cloned()
    }

    pub fn latest(&self, user_id: &str) -> Option<Session> {
        self.known
            .get(user_id)
            .and_then(|sessions| sessions.values().next_back())
            .cloned()
    }

    /// Latest known session for `user_id` whose window closed by `at`.
    /// Sessions starting after `at` are never candidates.
    pub fn ended_by(&self, user_id: &str, at: DateTime<Utc>) -> Option<Session> {
        self.known
            .get(user_id)?
            .range(..=at)
            .rev()
            .map(|(_, session)| session)
            .find(|session| session.end_time <= at)
            .cloned()
    }

    pub fn remember(&mut self, session: Session) {
        self.known
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.start_time, session);
    }

    /// Drops sessions that ended more than one session length before `now`,
    /// always keeping each user's latest.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.length;
        for sessions in self.known.values_mut() {
            let latest = sessions.keys().next_back().copied();
            sessions.retain(|start, session| Some(*start) == latest || session.end_time > horizon);
        }
        self.known.retain(|_, sessions| !sessions.is_empty());
    }

    pub fn known_sessions(&self) -> usize {
        self.known.values().map(BTreeMap::len).sum()
    }

    fn cached_covering(&self, user_id: &str, at: DateTime<Utc>) -> Option<Session> {
        let sessions = self.known.get(user_id)?;
        let (_, candidate) = sessions.range(..=at).next_back()?;
        candidate.covers(at).then(|| candidate.clone())
    }

    fn next_after(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        store: &dyn ActivityStore,
    ) -> Result<Option<Session>, StoreError> {
        let cached = self.known.get(user_id).and_then(|sessions| {
            sessions
                .range((std::ops::Bound::Excluded(at), std::ops::Bound::Unbounded))
                .next()
                .map(|(_, session)| session.clone())
        });
        let stored = store.find_next_session(user_id, at)?;
        Ok(match (cached, stored) {
            (Some(a), Some(b)) => Some(if a.start_time <= b.start_time { a } else { b }),
            (a, b) => a.or(b),
        })
    }
}
