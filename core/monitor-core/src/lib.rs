//! # monitor-core
//!
//! Core library for the Claude activity monitor. It turns raw activity signals
//! (process launches, network connections, HTTP requests, hook callbacks) into
//! fixed 5-hour sessions and idle-delimited work blocks.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The daemon wraps the tracker in threads.
//! - **Pure decisions**: Classification and time validation are free functions over values.
//! - **Derived state**: Session activeness is always computed from `now` vs stored boundaries;
//!   there is no stored "is active" flag anywhere.
//! - **Memory is authoritative**: State transitions happen in memory under one lock; persistence
//!   is queued behind a [`PersistSink`] and never blocks a transition.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use monitor_core::{ActivityTracker, MemoryStore, InlinePersist, MonitorConfig, SignalEvent};
//!
//! let store = Arc::new(MemoryStore::new());
//! let tracker = ActivityTracker::new(MonitorConfig::default(), store.clone(),
//!     Arc::new(InlinePersist::new(store)));
//! tracker.ingest(&SignalEvent::process_exec(Utc::now(), 4242, "claude"))?;
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod idle;
pub mod patterns;
pub mod persist;
pub mod session;
pub mod signal;
pub mod store;
pub mod summary;
pub mod time_validation;
pub mod tracker;
pub mod workblock;

pub use classifier::{ActivityClassifier, ActivityJudgment, ActivityReason, ConfidenceSource};
pub use config::{ClassifierConfig, MonitorConfig, PersistenceConfig, ScannerConfig, TrackingConfig};
pub use error::{ConfigError, StoreError, TrackerError};
pub use idle::{IdleDecision, IdleTracker};
pub use persist::{
    BackgroundPersist, InlinePersist, PersistHealth, PersistHealthSnapshot, PersistOp, PersistSink,
    RetryPolicy,
};
pub use session::{Session, SessionManager, SessionResolution, SessionState};
pub use signal::{ContextKey, SignalEvent, SignalKind};
pub use store::{ActivityStore, MemoryStore};
pub use summary::WorkSummary;
pub use tracker::{ActivityTracker, IngestOutcome, JudgmentStats, TrackerSnapshot};
pub use workblock::{BlockOutcome, CloseReason, WorkBlock, WorkBlockManager};
