use std::sync::Arc;

use chronicle_core::{
    tracker::EXCESSIVE_DELAY_DETAIL, EndpointId, FinishedStatus, TargetId, Timestamp, Tracker,
};
use chronicle_persistence::{FinishOutcome, StorageError, TrackerStore};

/// Tracker lifecycle on top of a [`TrackerStore`].
#[derive(Clone)]
pub struct TrackerManager {
    store: Arc<dyn TrackerStore>,
    max_delay_ms: i64,
}

impl TrackerManager {
    pub fn new(store: Arc<dyn TrackerStore>, max_delay_ms: i64) -> Self {
        Self {
            store,
            max_delay_ms,
        }
    }

    pub fn store(&self) -> &dyn TrackerStore {
        &*self.store
    }

    /// Returns the pair's unfinished tracker, creating a Scheduled one if needed.
    pub fn schedule(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
        at: Timestamp,
        continuation: Option<String>,
    ) -> Result<Tracker, StorageError> {
        self.store.create_scheduled(target, endpoint, at, continuation)
    }

    pub fn current(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
    ) -> Result<Option<Tracker>, StorageError> {
        self.store.unfinished(target, endpoint)
    }

    /// Scheduled -> Running. `None` means another attempt replaced this one.
    pub fn pickup(
        &self,
        tracker: &Tracker,
        now: Timestamp,
    ) -> Result<Option<Tracker>, StorageError> {
        self.store.start_tracker(tracker, now)
    }

    pub fn is_stale(&self, tracker: &Tracker, now: Timestamp) -> bool {
        tracker.is_stale(now, self.max_delay_ms)
    }

    /// Force-finishes a tracker stuck in Running. Does not reschedule.
    pub fn expire_if_stale(
        &self,
        tracker: &Tracker,
        now: Timestamp,
    ) -> Result<Option<FinishOutcome>, StorageError> {
        if !self.is_stale(tracker, now) {
            return Ok(None);
        }
        tracing::warn!(
            "tracker {} for {}/{} running since {:?}, terminating",
            tracker.id,
            tracker.target,
            tracker.endpoint,
            tracker.sync_started_at
        );
        self.finish(tracker, FinishedStatus::Warning, EXCESSIVE_DELAY_DETAIL, now)
            .map(Some)
    }

    /// Records the outcome and moves the tracker into history.
    pub fn finish(
        &self,
        tracker: &Tracker,
        status: FinishedStatus,
        detail: impl Into<String>,
        now: Timestamp,
    ) -> Result<FinishOutcome, StorageError> {
        let mut finished = tracker.clone();
        if !finished.finish(status, detail, now) {
            return Ok(FinishOutcome::RaceLost);
        }
        self.store.finish_tracker(&finished)
    }
}
