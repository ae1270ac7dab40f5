use std::collections::BTreeSet;
use std::time::Duration;

use chronicle_core::{FinishedStatus, Timestamp};
use chronicle_infra::ErrorInfo;
use chronicle_persistence::StorageError;

pub mod commit;
pub mod engine;

pub use commit::{BatchCommitter, CommitError, CommitStats};
pub use engine::SyncEngine;

/// Source of "now" for the engine, in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_delay: Duration,
    pub default_delay: Duration,
    pub batch_size: usize,
    /// Endpoints an operator switched off.
    pub excluded: BTreeSet<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(chronicle_config::DEFAULT_MAX_DELAY_SECS),
            default_delay: Duration::from_secs(chronicle_config::DEFAULT_RESCHEDULE_DELAY_SECS),
            batch_size: chronicle_config::DEFAULT_BATCH_SIZE,
            excluded: BTreeSet::new(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &chronicle_config::EngineConfig) -> Self {
        Self {
            max_delay: config.max_delay(),
            default_delay: config.default_reschedule_delay(),
            batch_size: config.batch_size,
            excluded: config.excluded_endpoints.clone(),
        }
    }
}

/// Why an attempt ended in error. The display form is the tracker detail.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("client error: {0}")]
    Client(ErrorInfo),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("commit error: {0}")]
    Commit(#[from] CommitError),
    /// Another worker finished or replaced the tracker first.
    #[error("tracker was finished by another worker")]
    RaceLost,
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl From<StorageError> for SyncError {
    fn from(value: StorageError) -> Self {
        SyncError::Unexpected(value.to_string())
    }
}

/// What one call to [`SyncEngine::synch`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No unfinished tracker for the pair.
    Idle,
    /// The unfinished tracker is already finished.
    AlreadyFinished,
    /// The target no longer resolves; any unfinished tracker was closed.
    TargetGone,
    /// A Running tracker exceeded the maximum delay and was closed.
    Expired,
    /// Prerequisite endpoints have not succeeded yet; tracker left as is.
    Blocked,
    Finished {
        status: FinishedStatus,
        detail: String,
        updates: usize,
        next_run: Option<Timestamp>,
    },
    RaceLost,
    /// Unexpected failure; a Running tracker is left for staleness recovery.
    Aborted(String),
}
