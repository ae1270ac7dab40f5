//! Per (target, endpoint) schedule/progress record.
//!
//! ```text
//! Scheduled --start--> Running --finish--> Finished(*)
//!     \________________finish____________/
//! ```
//!
//! Only unfinished trackers (Scheduled or Running) are mutable. Finishing is
//! one-way; the next attempt is a new tracker.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EndpointId, TargetId, Timestamp};

pub type TrackerId = Uuid;

/// Detail recorded when a Running tracker is reclaimed by the staleness check.
pub const EXCESSIVE_DELAY_DETAIL: &str = "terminated due to excessive delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishedStatus {
    Success,
    Error,
    Warning,
    Excluded,
    NotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackerStatus {
    Scheduled,
    Running,
    Finished(FinishedStatus),
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerStatus::Scheduled => f.write_str("scheduled"),
            TrackerStatus::Running => f.write_str("running"),
            TrackerStatus::Finished(s) => write!(f, "finished-{}", format!("{s:?}").to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: TrackerId,
    pub target: TargetId,
    pub endpoint: EndpointId,
    pub scheduled_at: Timestamp,
    pub sync_started_at: Option<Timestamp>,
    pub sync_ended_at: Option<Timestamp>,
    pub status: TrackerStatus,
    pub detail: String,
    /// Opaque token (e.g. an ETag) handed to the next fetch.
    pub continuation: Option<String>,
}

impl Tracker {
    pub fn scheduled(
        target: TargetId,
        endpoint: EndpointId,
        scheduled_at: Timestamp,
        continuation: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            endpoint,
            scheduled_at,
            sync_started_at: None,
            sync_ended_at: None,
            status: TrackerStatus::Scheduled,
            detail: String::new(),
            continuation,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TrackerStatus::Finished(_))
    }

    pub fn is_running(&self) -> bool {
        self.status == TrackerStatus::Running
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        !self.is_finished() && self.scheduled_at <= now
    }

    /// Scheduled -> Running. Repeated pickups leave `sync_started_at` untouched.
    /// Returns whether the state changed.
    pub fn start(&mut self, now: Timestamp) -> bool {
        if self.status != TrackerStatus::Scheduled {
            return false;
        }
        self.status = TrackerStatus::Running;
        self.sync_started_at = Some(now);
        true
    }

    /// Running for longer than `max_delay` milliseconds.
    pub fn is_stale(&self, now: Timestamp, max_delay: i64) -> bool {
        match (self.status, self.sync_started_at) {
            (TrackerStatus::Running, Some(started)) => now.saturating_sub(started) > max_delay,
            _ => false,
        }
    }

    /// Records the terminal outcome. The continuation survives only on success.
    /// Returns false (and changes nothing) when already finished.
    pub fn finish(
        &mut self,
        status: FinishedStatus,
        detail: impl Into<String>,
        now: Timestamp,
    ) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TrackerStatus::Finished(status);
        self.detail = detail.into();
        self.sync_ended_at = Some(now);
        if status != FinishedStatus::Success {
            self.continuation = None;
        }
        true
    }
}
