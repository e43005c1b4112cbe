//! Write path from in-memory decisions to the storage collaborator.
//!
//! State transitions produce [`PersistOp`]s and hand them to a [`PersistSink`].
//! A sink never reports failure back to the transition: the in-memory decision
//! stands, and failed writes are retried with linear backoff and then counted
//! in [`PersistHealth`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use serde::Serialize;

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::session::Session;
use crate::store::ActivityStore;
use crate::workblock::WorkBlock;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    CreateSession(Session),
    UpdateSession(Session),
    UpsertWorkBlock(WorkBlock),
}

impl PersistOp {
    pub fn apply(&self, store: &dyn ActivityStore) -> Result<(), StoreError> {
        match self {
            PersistOp::CreateSession(session) => store.create_session(session),
            PersistOp::UpdateSession(session) => store.update_session(session),
            PersistOp::UpsertWorkBlock(block) => store.upsert_work_block(block),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PersistOp::CreateSession(_) => "create_session",
            PersistOp::UpdateSession(_) => "update_session",
            PersistOp::UpsertWorkBlock(_) => "upsert_work_block",
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            PersistOp::CreateSession(session) | PersistOp::UpdateSession(session) => &session.id,
            PersistOp::UpsertWorkBlock(block) => &block.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: StdDuration,
    pub max_delay: StdDuration,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            step: StdDuration::from_millis(config.backoff_step_ms),
            max_delay: StdDuration::from_millis(config.backoff_max_ms),
        }
    }

    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            step: StdDuration::ZERO,
            max_delay: StdDuration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): `step * attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> StdDuration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

/// Write counters shared between the writer and whoever reports health.
#[derive(Debug, Default)]
pub struct PersistHealth {
    written: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    last_write_failed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistHealthSnapshot {
    pub written: u64,
    pub retried: u64,
    pub dropped: u64,
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl PersistHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.last_write_failed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PersistHealthSnapshot {
        PersistHealthSnapshot {
            written: self.written.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            degraded: self.is_degraded(),
            last_error: self
                .last_error
                .lock()
                .map(|value| value.clone())
                .unwrap_or_default(),
        }
    }

    fn record_success(&self) {
        self.written.fetch_add(1, Ordering::SeqCst);
        self.last_write_failed.store(false, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn record_dropped(&self, err: &StoreError) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
        self.last_write_failed.store(true, Ordering::SeqCst);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
    }
}

/// Applies `op`, retrying with backoff. Returns false when retries ran out.
pub fn write_with_retry(
    store: &dyn ActivityStore,
    op: &PersistOp,
    policy: &RetryPolicy,
    health: &PersistHealth,
    sleep: &dyn Fn(StdDuration),
) -> bool {
    let mut attempt = 1;
    loop {
        match op.apply(store) {
            Ok(()) => {
                health.record_success();
                return true;
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op.label(),
                    record_id = op.record_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Persist write failed; retrying"
                );
                health.record_retry();
                sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                tracing::error!(
                    op = op.label(),
                    record_id = op.record_id(),
                    attempts = attempt,
                    error = %err,
                    "Persist write failed; retries exhausted"
                );
                health.record_dropped(&err);
                return false;
            }
        }
    }
}

pub trait PersistSink: Send + Sync {
    /// Queues or applies `op`. Never blocks the caller on a failing store.
    fn submit(&self, op: PersistOp);

    fn health(&self) -> &PersistHealth;

    /// Blocks until every op submitted so far has been attempted.
    fn drain(&self) {}
}

/// Writes synchronously on the caller's thread.
pub struct InlinePersist {
    store: Arc<dyn ActivityStore>,
    policy: RetryPolicy,
    health: PersistHealth,
}

impl InlinePersist {
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self::with_policy(store, RetryPolicy::single_attempt())
    }

    pub fn with_policy(store: Arc<dyn ActivityStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            health: PersistHealth::new(),
        }
    }
}

impl PersistSink for InlinePersist {
    fn submit(&self, op: PersistOp) {
        write_with_retry(
            self.store.as_ref(),
            &op,
            &self.policy,
            &self.health,
            &thread::sleep,
        );
    }

    fn health(&self) -> &PersistHealth {
        &self.health
    }
}

enum WriterCommand {
    Write(PersistOp),
    Barrier(Sender<()>),
}

/// Single writer thread fed by a channel.
pub struct BackgroundPersist {
    sender: Mutex<Option<Sender<WriterCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    health: Arc<PersistHealth>,
}

impl BackgroundPersist {
    pub fn spawn(store: Arc<dyn ActivityStore>, policy: RetryPolicy) -> Result<Self, String> {
        let (sender, receiver) = mpsc::channel();
        let health = Arc::new(PersistHealth::new());
        let worker_health = Arc::clone(&health);
        let worker = thread::Builder::new()
            .name("persist-writer".to_string())
            .spawn(move || run_writer(store, policy, worker_health, receiver))
            .map_err(|err| format!("Failed to spawn persist writer: {}", err))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            health,
        })
    }

    /// Stops accepting ops, lets the writer finish its queue, and joins it.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Persist writer thread panicked");
            }
        }
    }

    fn send(&self, command: WriterCommand) -> bool {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        match sender.as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }
}

impl PersistSink for BackgroundPersist {
    fn submit(&self, op: PersistOp) {
        let label = op.label();
        if !self.send(WriterCommand::Write(op)) {
            tracing::error!(op = label, "Persist writer is not running; dropping write");
            self.health.record_dropped(&StoreError::Unavailable(
                "persist writer stopped".to_string(),
            ));
        }
    }

    fn health(&self) -> &PersistHealth {
        &self.health
    }

    fn drain(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.send(WriterCommand::Barrier(done_tx)) {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for BackgroundPersist {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(
    store: Arc<dyn ActivityStore>,
    policy: RetryPolicy,
    health: Arc<PersistHealth>,
    receiver: Receiver<WriterCommand>,
) {
    while let Ok(command) = receiver.recv() {
        match command {
            WriterCommand::Write(op) => {
                write_with_retry(store.as_ref(), &op, &policy, &health, &thread::sleep);
            }
            WriterCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Persist writer stopped");
}
