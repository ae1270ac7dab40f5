use serde::{Deserialize, Serialize};

pub mod endpoint;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod target;
pub mod tracker;

pub use endpoint::{Endpoint, EndpointId};
pub use reconcile::reconcile;
pub use record::{evolve, setup, Attributes, Fact, NaturalKey, RecordId, Update, Versioned};
pub use snapshot::{Snapshot, SnapshotNode};
pub use target::{Target, TargetId, TargetIdParseError};
pub use tracker::{FinishedStatus, Tracker, TrackerId, TrackerStatus};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Upper bound of the live version's interval (+∞).
pub const LIFE_OPEN: Timestamp = Timestamp::MAX;

/// Half-open validity interval `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Lifetime {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Lifetime {
    /// An interval starting at `start` that is still open.
    pub fn open_at(start: Timestamp) -> Self {
        Self {
            start,
            end: LIFE_OPEN,
        }
    }

    pub fn is_live(&self) -> bool {
        self.end == LIFE_OPEN
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at < self.end
    }

    /// Returns the interval closed at `at`.
    pub fn closed_at(self, at: Timestamp) -> Self {
        Self {
            start: self.start,
            end: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_is_half_open() {
        let life = Lifetime { start: 10, end: 20 };
        assert!(life.contains(10));
        assert!(life.contains(19));
        assert!(!life.contains(20));
        assert!(!life.contains(9));
        assert!(!life.is_live());
    }

    #[test]
    fn open_lifetime_contains_the_far_future() {
        let life = Lifetime::open_at(5);
        assert!(life.is_live());
        assert!(life.contains(LIFE_OPEN - 1));
        assert_eq!(life.closed_at(7), Lifetime { start: 5, end: 7 });
    }
}
