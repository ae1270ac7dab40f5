use chronicle_core::{
    Endpoint, Fact, FinishedStatus, Target, TargetId, Timestamp, TrackerStatus, Update,
};
use chronicle_infra::{FetchError, Fetched, RawData};
use chronicle_persistence::{RecordStore, StorageError, TrackerStore};

mod json;

pub use json::JsonEndpointAdapter;

/// The adapter could not make sense of a successful response.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Malformed(String),
    #[error("loading live records failed: {0}")]
    Storage(#[from] StorageError),
}

/// What `process` may look at: the sync instant, the target and the store.
pub struct ProcessContext<'a> {
    pub at: Timestamp,
    pub target: &'a Target,
    pub records: &'a dyn RecordStore,
}

/// Endpoint-specific behavior plugged into the generic engine.
#[async_trait::async_trait]
pub trait EndpointAdapter: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Whether this endpoint is synchronized for `target` at all.
    fn applies_to(&self, _target: TargetId) -> bool {
        true
    }

    async fn fetch(
        &self,
        target: &Target,
        continuation: Option<&str>,
    ) -> Result<Fetched, FetchError>;

    /// Turns fetched data into the updates that bring the store up to date at `ctx.at`.
    fn process(
        &self,
        ctx: &ProcessContext<'_>,
        data: &RawData,
    ) -> Result<Vec<Update<Fact>>, ProcessingError>;

    /// Every prerequisite endpoint's last attempt for `target` succeeded.
    fn prerequisites_satisfied(
        &self,
        target: TargetId,
        trackers: &dyn TrackerStore,
    ) -> Result<bool, StorageError> {
        for prerequisite in &self.endpoint().prerequisites {
            let last = trackers.last_finished(target, prerequisite)?;
            let succeeded = last
                .map(|t| t.status == TrackerStatus::Finished(FinishedStatus::Success))
                .unwrap_or(false);
            if !succeeded {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
