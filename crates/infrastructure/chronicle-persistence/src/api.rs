use chronicle_core::{
    EndpointId, Fact, NaturalKey, RecordId, Target, TargetId, Timestamp, Tracker, Update,
};

pub const CHRONICLE_REDB_FILENAME: &str = "chronicle.redb";
pub const CURRENT_SCHEMA: u32 = 1;

/// Page size used by [`RecordStore::get_all_live`].
pub const LIVE_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Missing,
    Valid,
    Busy,
    Corrupt,
    NewerSchema { found: u32, supported: u32 },
}

/// Result of trying to move an unfinished tracker into history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished(Tracker),
    /// The unfinished row vanished or belongs to another attempt.
    RaceLost,
}

/// Source of truth for target identity, scopes and credential validity.
pub trait TargetDirectory: Send + Sync {
    fn resolve(&self, id: TargetId) -> Result<Option<Target>, crate::StorageError>;

    fn upsert_target(&self, target: &Target) -> Result<(), crate::StorageError>;

    /// Returns whether a target was removed.
    fn remove_target(&self, id: TargetId) -> Result<bool, crate::StorageError>;

    fn list_targets(&self) -> Result<Vec<Target>, crate::StorageError>;
}

/// Unfinished trackers (at most one per pair) plus the append-only history.
pub trait TrackerStore: Send + Sync {
    /// Creates a Scheduled tracker, or returns the pair's existing unfinished one.
    fn create_scheduled(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
        scheduled_at: Timestamp,
        continuation: Option<String>,
    ) -> Result<Tracker, crate::StorageError>;

    fn unfinished(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
    ) -> Result<Option<Tracker>, crate::StorageError>;

    fn list_unfinished(&self) -> Result<Vec<Tracker>, crate::StorageError>;

    /// Scheduled -> Running for the attempt identified by `tracker.id`.
    /// Returns `None` when that attempt is no longer the pair's unfinished tracker.
    fn start_tracker(
        &self,
        tracker: &Tracker,
        now: Timestamp,
    ) -> Result<Option<Tracker>, crate::StorageError>;

    /// Moves an already-finished tracker into history if its unfinished row is
    /// still the same attempt.
    fn finish_tracker(&self, finished: &Tracker) -> Result<FinishOutcome, crate::StorageError>;

    /// Finished trackers for a pair, newest first.
    fn history(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
        limit: usize,
    ) -> Result<Vec<Tracker>, crate::StorageError>;

    fn last_finished(
        &self,
        target: TargetId,
        endpoint: &EndpointId,
    ) -> Result<Option<Tracker>, crate::StorageError> {
        Ok(self.history(target, endpoint, 1)?.into_iter().next())
    }

    /// Unfinished trackers whose schedule has come, Running ones included.
    fn due(&self, now: Timestamp) -> Result<Vec<Tracker>, crate::StorageError> {
        let mut due: Vec<Tracker> = self
            .list_unfinished()?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect();
        due.sort_by_key(|t| t.scheduled_at);
        Ok(due)
    }
}

/// Bitemporal storage for [`Fact`] versions.
pub trait RecordStore: Send + Sync {
    /// The version of `key` whose interval contains `at`.
    fn get(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
        at: Timestamp,
    ) -> Result<Option<Fact>, crate::StorageError>;

    /// Up to `limit` versions containing `at`, ordered by id, strictly after `after`.
    fn live_page(
        &self,
        kind: &str,
        target: TargetId,
        at: Timestamp,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Fact>, crate::StorageError>;

    /// All versions of one key, oldest first.
    fn versions(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
    ) -> Result<Vec<Fact>, crate::StorageError>;

    /// Applies the updates in one atomic transaction.
    fn apply(&self, updates: &[Update<Fact>]) -> Result<(), crate::StorageError>;

    /// Retires every live version held for a deleted target. Returns how many.
    fn retire_target(&self, target: TargetId, at: Timestamp) -> Result<usize, crate::StorageError>;

    /// Follows the id cursor until a page comes back empty.
    fn get_all_live(
        &self,
        kind: &str,
        target: TargetId,
        at: Timestamp,
    ) -> Result<Vec<Fact>, crate::StorageError> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.live_page(kind, target, at, cursor, LIVE_PAGE_SIZE)?;
            let next = page.last().and_then(|f| f.id);
            out.extend(page);
            match next {
                Some(id) => cursor = Some(id),
                None => break,
            }
        }
        Ok(out)
    }
}
