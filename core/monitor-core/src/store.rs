//! Storage collaborator contract.
//!
//! The tracker reads through [`ActivityStore`] on cold caches and writes
//! through a [`PersistSink`](crate::persist::PersistSink). The daemon backs
//! this with SQLite; [`MemoryStore`] backs tests and embedders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::session::Session;
use crate::signal::ContextKey;
use crate::workblock::WorkBlock;

pub trait ActivityStore: Send + Sync {
    /// Session for `user_id` with `start_time <= at < end_time`.
    fn find_active_session(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    /// Earliest session for `user_id` starting strictly after `after`.
    fn find_next_session(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Writes bookkeeping fields. Boundaries are immutable and never rewritten.
    fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    fn upsert_work_block(&self, block: &WorkBlock) -> Result<(), StoreError>;

    fn find_open_work_block(&self, key: &ContextKey) -> Result<Option<WorkBlock>, StoreError>;

    fn open_work_blocks(&self) -> Result<Vec<WorkBlock>, StoreError>;

    /// Closed blocks whose start falls in `[from, to)`, ordered by start.
    fn work_blocks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkBlock>, StoreError>;
}

/// In-memory store. Can be switched into a failing mode to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    blocks: Mutex<HashMap<String, WorkBlock>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by_key(|session| session.start_time);
        matching
    }

    pub fn all_work_blocks(&self) -> Vec<WorkBlock> {
        let blocks = self
            .blocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<WorkBlock> = blocks.values().cloned().collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        all
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>, StoreError> {
        self.check_available()?;
        self.sessions
            .lock()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))
    }

    fn blocks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, WorkBlock>>, StoreError> {
        self.check_available()?;
        self.blocks
            .lock()
            .map_err(|_| StoreError::Unavailable("work block map poisoned".to_string()))
    }
}

impl ActivityStore for MemoryStore {
    fn find_active_session(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions()?
            .values()
            .find(|session| session.user_id == user_id && session.covers(at))
            .cloned())
    }

    fn find_next_session(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions()?
            .values()
            .filter(|session| session.user_id == user_id && session.start_time > after)
            .min_by_key(|session| session.start_time)
            .cloned())
    }

    fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions()?.get(session_id).cloned())
    }

    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions()?;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::query(
                "create_session",
                format!("duplicate session id {}", session.id),
            ));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions()?;
        let Some(stored) = sessions.get_mut(&session.id) else {
            return Err(StoreError::query(
                "update_session",
                format!("unknown session id {}", session.id),
            ));
        };
        stored.activity_count = session.activity_count;
        stored.first_activity_time = session.first_activity_time;
        stored.last_activity_time = session.last_activity_time;
        Ok(())
    }

    fn upsert_work_block(&self, block: &WorkBlock) -> Result<(), StoreError> {
        self.blocks()?.insert(block.id.clone(), block.clone());
        Ok(())
    }

    fn find_open_work_block(&self, key: &ContextKey) -> Result<Option<WorkBlock>, StoreError> {
        Ok(self
            .blocks()?
            .values()
            .filter(|block| {
                block.is_open() && block.session_id == key.session_id && block.project == key.project
            })
            .max_by_key(|block| block.start_time)
            .cloned())
    }

    fn open_work_blocks(&self) -> Result<Vec<WorkBlock>, StoreError> {
        let mut open: Vec<WorkBlock> = self
            .blocks()?
            .values()
            .filter(|block| block.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|block| block.start_time);
        Ok(open)
    }

    fn work_blocks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkBlock>, StoreError> {
        let mut matching: Vec<WorkBlock> = self
            .blocks()?
            .values()
            .filter(|block| !block.is_open() && block.start_time >= from && block.start_time < to)
            .cloned()
            .collect();
        matching.sort_by_key(|block| block.start_time);
        Ok(matching)
    }
}
