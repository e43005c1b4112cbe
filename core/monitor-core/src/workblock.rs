//! Work blocks: continuous activity periods inside one session.
//!
//! Per context key the lifecycle is `NoBlock -> Open -> Closed`, with a fresh
//! `Open` allowed after every close:
//!
//! - The first qualifying activity opens a block at the signal time.
//! - Activity within the idle threshold extends it.
//! - Activity after a longer gap closes it at its **last activity** (not at the
//!   signal that noticed the gap) and opens a new one.
//! - The periodic sweep, a session rollover, or a shutdown flush close blocks
//!   without new activity.
//! - A block of an ended session closes at the session end when its activity
//!   was still continuous there (last activity within the idle threshold of the
//!   end, or Claude still processing), otherwise at its last activity. Sweep and
//!   rollover apply the same rule.
//!
//! Every close goes through [`finalize`], which keeps the block inside its
//! session and within the configured maximum duration.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::idle::{IdleDecision, IdleTracker};
use crate::session::Session;
use crate::signal::{ContextKey, SignalKind};
use crate::time_validation::{bound_duration, is_valid_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A later signal found the idle gap exceeded.
    IdleTimeout,
    /// The owning session ended.
    SessionBoundary,
    /// The periodic sweep found the block idle.
    Sweep,
    /// Daemon shutdown or an explicit flush request.
    Flush,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::SessionBoundary => "session_boundary",
            CloseReason::Sweep => "sweep",
            CloseReason::Flush => "flush",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle_timeout" => Some(CloseReason::IdleTimeout),
            "session_boundary" => Some(CloseReason::SessionBoundary),
            "sweep" => Some(CloseReason::Sweep),
            "flush" => Some(CloseReason::Flush),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBlock {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub project: String,
    /// Stable short hash of `project`, for grouping in reports.
    pub project_id: String,
    pub start_time: DateTime<Utc>,
    /// Unset while the block is open.
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity_time: DateTime<Utc>,
    pub activity_count: u64,
    /// Set on close only. Open blocks compute it on demand with [`WorkBlock::duration_at`].
    pub duration_seconds: Option<i64>,
    pub claude_processing_seconds: i64,
    pub close_reason: Option<CloseReason>,
    /// True when the close moved `end_time` to satisfy session or duration bounds.
    pub clamped: bool,
}

impl WorkBlock {
    pub fn open(session: &Session, project: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            project: project.to_string(),
            project_id: project_id(project),
            start_time: at,
            end_time: None,
            last_activity_time: at,
            activity_count: 1,
            duration_seconds: None,
            claude_processing_seconds: 0,
            close_reason: None,
            clamped: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn context_key(&self) -> ContextKey {
        ContextKey::new(self.session_id.clone(), self.project.clone())
    }

    pub fn duration_at(&self, now: DateTime<Utc>) -> i64 {
        match self.duration_seconds {
            Some(seconds) => seconds,
            None => (now - self.start_time).num_seconds().max(0),
        }
    }
}

pub fn project_id(project: &str) -> String {
    let digest = format!("{:x}", md5::compute(project.as_bytes()));
    digest[..12].to_string()
}

/// Closes `block` at `requested_end`, bounded by `session_end` and `max`.
pub fn finalize(
    block: &mut WorkBlock,
    requested_end: DateTime<Utc>,
    session_end: DateTime<Utc>,
    max: Duration,
    reason: CloseReason,
) {
    let mut end = requested_end;
    let mut clamped = false;
    if end > session_end {
        tracing::warn!(
            block_id = %block.id,
            session_id = %block.session_id,
            requested_end = %requested_end,
            session_end = %session_end,
            "Work block would outlive its session; closing at session end"
        );
        end = session_end;
        clamped = true;
    }

    if !is_valid_duration(&block.start_time, &end, max) {
        tracing::warn!(
            block_id = %block.id,
            start = %block.start_time,
            requested_end = %end,
            max_secs = max.num_seconds(),
            "Work block duration out of bounds; clamped"
        );
        clamped = true;
    }
    let bounded = bound_duration(block.start_time, end, max);

    block.end_time = Some(bounded.end);
    block.duration_seconds = Some(bounded.seconds);
    block.close_reason = Some(reason);
    block.clamped = clamped;
    if block.claude_processing_seconds > bounded.seconds {
        block.claude_processing_seconds = bounded.seconds;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Opened(WorkBlock),
    Extended(WorkBlock),
    Split { closed: WorkBlock, opened: WorkBlock },
    /// Out-of-order signal; nothing changed.
    Ignored,
}

impl BlockOutcome {
    /// The block the signal landed in, if any.
    pub fn current(&self) -> Option<&WorkBlock> {
        match self {
            BlockOutcome::Opened(block) | BlockOutcome::Extended(block) => Some(block),
            BlockOutcome::Split { opened, .. } => Some(opened),
            BlockOutcome::Ignored => None,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenBlock {
    block: WorkBlock,
    session_end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkBlockManager {
    idle: IdleTracker,
    max_block: Duration,
    open: HashMap<ContextKey, OpenBlock>,
}

impl WorkBlockManager {
    pub fn new(idle: IdleTracker, max_block: Duration) -> Self {
        Self {
            idle,
            max_block,
            open: HashMap::new(),
        }
    }

    /// Applies one qualifying activity from `project` inside `session`.
    ///
    /// `session` must cover `at`.
    pub fn record(
        &mut self,
        session: &Session,
        project: &str,
        kind: SignalKind,
        at: DateTime<Utc>,
    ) -> BlockOutcome {
        let key = ContextKey::new(session.id.clone(), project);
        let mut closed = None;

        match self.idle.evaluate(&key, at) {
            IdleDecision::OutOfOrder => return BlockOutcome::Ignored,
            IdleDecision::StartNew => {
                if let Some(mut previous) = self.open.remove(&key) {
                    let end = previous.block.last_activity_time;
                    finalize(
                        &mut previous.block,
                        end,
                        previous.session_end,
                        self.max_block,
                        CloseReason::IdleTimeout,
                    );
                    closed = Some(previous.block);
                }
                self.open_new(&key, session, at);
            }
            IdleDecision::Continue => match self.open.get_mut(&key) {
                Some(current) => {
                    current.block.last_activity_time = current.block.last_activity_time.max(at);
                    current.block.activity_count += 1;
                }
                None => self.open_new(&key, session, at),
            },
        }

        match kind {
            SignalKind::ProcessingStart => self.idle.begin_processing(&key, at),
            SignalKind::ProcessingEnd => {
                if let Some(elapsed) = self.idle.end_processing(&key, at) {
                    if let Some(current) = self.open.get_mut(&key) {
                        current.block.claude_processing_seconds += elapsed.num_seconds();
                    }
                }
            }
            _ => {}
        }

        let Some(current) = self.open.get(&key).map(|open| open.block.clone()) else {
            return BlockOutcome::Ignored;
        };
        match closed {
            Some(closed) => BlockOutcome::Split {
                closed,
                opened: current,
            },
            None if current.activity_count == 1 => BlockOutcome::Opened(current),
            None => BlockOutcome::Extended(current),
        }
    }

    /// Refreshes an in-flight processing window without counting activity.
    pub fn touch_processing(&mut self, key: &ContextKey, at: DateTime<Utc>) -> bool {
        self.idle.touch_processing(key, at)
    }

    pub fn is_processing(&self, key: &ContextKey, now: DateTime<Utc>) -> bool {
        self.idle.is_processing(key, now)
    }

    /// Closes every open block of `previous` after a rollover.
    pub fn close_session_blocks(&mut self, previous: &Session) -> Vec<WorkBlock> {
        let keys: Vec<ContextKey> = self
            .open
            .keys()
            .filter(|key| key.session_id == previous.id)
            .cloned()
            .collect();

        let mut closed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(mut entry) = self.open.remove(&key) else {
                continue;
            };
            let end = self.boundary_end(&key, &entry);
            finalize(
                &mut entry.block,
                end,
                entry.session_end,
                self.max_block,
                CloseReason::SessionBoundary,
            );
            self.idle.forget(&key);
            closed.push(entry.block);
        }
        closed.sort_by_key(|block| block.start_time);
        closed
    }

    /// Closes blocks that went idle or whose session ended, as of `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<WorkBlock> {
        let mut closing = Vec::new();
        for (key, entry) in &self.open {
            if now >= entry.session_end {
                let end = self.boundary_end(key, entry);
                closing.push((key.clone(), end, CloseReason::SessionBoundary));
            } else if self.idle.is_idle(key, now) {
                closing.push((key.clone(), entry.block.last_activity_time, CloseReason::Sweep));
            }
        }

        let mut closed = Vec::with_capacity(closing.len());
        for (key, end, reason) in closing {
            if let Some(mut entry) = self.open.remove(&key) {
                finalize(&mut entry.block, end, entry.session_end, self.max_block, reason);
                self.idle.forget(&key);
                closed.push(entry.block);
            }
        }
        closed.sort_by_key(|block| block.start_time);
        closed
    }

    /// Closes every open block at its last activity.
    pub fn flush(&mut self) -> Vec<WorkBlock> {
        let max_block = self.max_block;
        let mut closed: Vec<WorkBlock> = self
            .open
            .drain()
            .map(|(_, mut entry)| {
                let end = entry.block.last_activity_time;
                finalize(
                    &mut entry.block,
                    end,
                    entry.session_end,
                    max_block,
                    CloseReason::Flush,
                );
                entry.block
            })
            .collect();
        for block in &closed {
            self.idle.forget(&block.context_key());
        }
        closed.sort_by_key(|block| block.start_time);
        closed
    }

    /// Re-adopts an open block loaded from storage.
    pub fn restore(&mut self, block: WorkBlock, session_end: DateTime<Utc>) {
        if !block.is_open() {
            return;
        }
        let key = block.context_key();
        self.idle.seed(&key, block.last_activity_time);
        tracing::debug!(block_id = %block.id, context = %key, "Restored open work block");
        self.open.insert(key, OpenBlock { block, session_end });
    }

    pub fn open_block(&self, key: &ContextKey) -> Option<&WorkBlock> {
        self.open.get(key).map(|entry| &entry.block)
    }

    pub fn has_open(&self, key: &ContextKey) -> bool {
        self.open.contains_key(key)
    }

    pub fn open_blocks(&self) -> Vec<WorkBlock> {
        let mut blocks: Vec<WorkBlock> = self.open.values().map(|entry| entry.block.clone()).collect();
        blocks.sort_by_key(|block| block.start_time);
        blocks
    }

    fn boundary_end(&self, key: &ContextKey, entry: &OpenBlock) -> DateTime<Utc> {
        let last = entry.block.last_activity_time;
        if entry.session_end - last <= self.idle.threshold()
            || self.idle.is_processing(key, entry.session_end)
        {
            entry.session_end
        } else {
            last
        }
    }

    fn open_new(&mut self, key: &ContextKey, session: &Session, at: DateTime<Utc>) {
        let block = WorkBlock::open(session, &key.project, at);
        tracing::debug!(block_id = %block.id, context = %key, start = %at, "Work block opened");
        self.open.insert(
            key.clone(),
            OpenBlock {
                block,
                session_end: session.end_time,
            },
        );
    }
}
