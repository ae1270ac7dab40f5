use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chronicle_core::{FinishedStatus, Target, TargetId, Timestamp, Tracker};
use chronicle_infra::{ErrorBudget, FetchError, RawData};
use chronicle_persistence::{FinishOutcome, RecordStore, TargetDirectory, TrackerStore};
use futures::FutureExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::adapter::{EndpointAdapter, ProcessContext};
use crate::sync::{BatchCommitter, Clock, SyncError, SyncOptions, SyncOutcome, SystemClock};
use crate::tracker::TrackerManager;

pub const SUCCESS_DETAIL: &str = "updated successfully";
pub const TARGET_GONE_DETAIL: &str = "target no longer exists";
pub const EXCLUDED_DETAIL: &str = "endpoint is excluded";

struct Completed {
    updates: usize,
    expires_at: Option<Timestamp>,
    continuation: Option<String>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked".to_string()
    }
}

/// Runs one fetch/process/commit attempt for a (target, endpoint) pair.
pub struct SyncEngine {
    targets: Arc<dyn TargetDirectory>,
    trackers: TrackerManager,
    records: Arc<dyn RecordStore>,
    budget: Arc<ErrorBudget>,
    clock: Arc<dyn Clock>,
    committer: BatchCommitter,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        targets: Arc<dyn TargetDirectory>,
        trackers: Arc<dyn TrackerStore>,
        records: Arc<dyn RecordStore>,
        budget: Arc<ErrorBudget>,
        options: SyncOptions,
    ) -> Self {
        Self {
            targets,
            trackers: TrackerManager::new(trackers, millis(options.max_delay)),
            records,
            budget,
            clock: Arc::new(SystemClock),
            committer: BatchCommitter::new(options.batch_size),
            options,
        }
    }

    /// Engine over a single store that keeps targets, trackers and records.
    pub fn from_store<S>(store: Arc<S>, budget: Arc<ErrorBudget>, options: SyncOptions) -> Self
    where
        S: TargetDirectory + TrackerStore + RecordStore + 'static,
    {
        let targets: Arc<dyn TargetDirectory> = store.clone();
        let trackers: Arc<dyn TrackerStore> = store.clone();
        let records: Arc<dyn RecordStore> = store;
        Self::new(targets, trackers, records, budget, options)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn trackers(&self) -> &TrackerManager {
        &self.trackers
    }

    pub fn targets(&self) -> &dyn TargetDirectory {
        &*self.targets
    }

    /// Whether a finished pair gets a next Scheduled tracker.
    pub fn should_reschedule(&self, target: &Target, adapter: &dyn EndpointAdapter) -> bool {
        let endpoint = adapter.endpoint();
        target.active
            && target.credentials_valid
            && target.has_scope(endpoint.required_scope.as_deref())
            && !self.options.excluded.contains(endpoint.id.as_str())
            && adapter.applies_to(target.id)
    }

    /// Synchronizes one pair. Never fails; the outcome says what happened.
    pub async fn synch(&self, adapter: &dyn EndpointAdapter, target: TargetId) -> SyncOutcome {
        let span = info_span!("synch", target = %target, endpoint = %adapter.endpoint().id);
        async {
            let started = Instant::now();
            let outcome = match AssertUnwindSafe(self.attempt(adapter, target))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(SyncError::RaceLost)) => SyncOutcome::RaceLost,
                Ok(Err(e)) => {
                    warn!("attempt aborted: {e}");
                    SyncOutcome::Aborted(e.to_string())
                }
                Err(payload) => {
                    let msg = panic_message(&*payload);
                    error!("attempt panicked: {msg}");
                    SyncOutcome::Aborted(msg)
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                SyncOutcome::Finished {
                    status,
                    updates,
                    next_run,
                    ..
                } => info!(
                    elapsed_ms,
                    updates = *updates,
                    status = ?status,
                    next_run = ?next_run,
                    "sync finished"
                ),
                other => debug!(elapsed_ms, outcome = ?other, "sync did not run"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn attempt(
        &self,
        adapter: &dyn EndpointAdapter,
        target_id: TargetId,
    ) -> Result<SyncOutcome, SyncError> {
        let endpoint = adapter.endpoint().clone();
        let now = self.clock.now();

        let Some(target) = self.targets.resolve(target_id)? else {
            if let Some(tracker) = self.trackers.current(target_id, &endpoint.id)? {
                self.trackers
                    .finish(&tracker, FinishedStatus::Error, TARGET_GONE_DETAIL, now)?;
            }
            return Ok(SyncOutcome::TargetGone);
        };

        let Some(tracker) = self.trackers.current(target_id, &endpoint.id)? else {
            return Ok(SyncOutcome::Idle);
        };
        if tracker.is_finished() {
            return Ok(SyncOutcome::AlreadyFinished);
        }

        if let Some(expired) = self.trackers.expire_if_stale(&tracker, now)? {
            return Ok(match expired {
                FinishOutcome::Finished(_) => SyncOutcome::Expired,
                FinishOutcome::RaceLost => SyncOutcome::RaceLost,
            });
        }

        if self.options.excluded.contains(endpoint.id.as_str()) {
            return self.refuse(&tracker, FinishedStatus::Excluded, EXCLUDED_DETAIL.into(), now);
        }
        if !target.has_scope(endpoint.required_scope.as_deref()) {
            let detail = format!(
                "missing scope {}",
                endpoint.required_scope.as_deref().unwrap_or_default()
            );
            return self.refuse(&tracker, FinishedStatus::NotAllowed, detail, now);
        }

        if !adapter.prerequisites_satisfied(target_id, self.trackers.store())? {
            debug!("prerequisites not yet satisfied");
            return Ok(SyncOutcome::Blocked);
        }

        let Some(tracker) = self.trackers.pickup(&tracker, now)? else {
            return Ok(SyncOutcome::RaceLost);
        };

        let (status, detail, updates, expires_at, continuation) =
            match self.run(adapter, &target, &tracker).await {
                Ok(done) => (
                    FinishedStatus::Success,
                    SUCCESS_DETAIL.to_string(),
                    done.updates,
                    done.expires_at,
                    done.continuation,
                ),
                Err(e @ SyncError::Unexpected(_)) => return Err(e),
                Err(e) => {
                    warn!("{e}");
                    (FinishedStatus::Error, e.to_string(), 0, None, None)
                }
            };

        let ended = self.clock.now();
        let mut finished = tracker.clone();
        finished.continuation = continuation.clone();
        let outcome = self.trackers.finish(&finished, status, detail.clone(), ended)?;
        if let FinishOutcome::RaceLost = outcome {
            debug!("tracker {} was finished elsewhere", tracker.id);
            return Ok(SyncOutcome::RaceLost);
        }

        let next_run = self.reschedule(adapter, target_id, expires_at, continuation, ended);
        Ok(SyncOutcome::Finished {
            status,
            detail,
            updates,
            next_run,
        })
    }

    async fn run(
        &self,
        adapter: &dyn EndpointAdapter,
        target: &Target,
        tracker: &Tracker,
    ) -> Result<Completed, SyncError> {
        let fetched = match adapter.fetch(target, tracker.continuation.as_deref()).await {
            Ok(fetched) => fetched,
            Err(FetchError::Client(info)) => {
                if let Some(wait) = self.budget.on_client_error(&info).await {
                    info!("cooled down for {:?} after {}", wait, info);
                }
                return Err(SyncError::Client(info));
            }
            Err(FetchError::Transport(msg)) => return Err(SyncError::Transport(msg)),
        };

        let at = self.clock.now();
        let ctx = ProcessContext {
            at,
            target,
            records: &*self.records,
        };
        let updates = adapter
            .process(&ctx, &fetched.data)
            .map_err(|e| SyncError::Processing(e.to_string()))?;
        let count = updates.len();

        let records = Arc::clone(&self.records);
        let committer = self.committer;
        let stats = tokio::task::spawn_blocking(move || committer.commit(&*records, &updates))
            .await
            .map_err(|e| SyncError::Unexpected(format!("commit task failed: {e}")))??;
        debug!(chunks = stats.chunks, writes = stats.writes, "committed");

        // A 304 without an ETag keeps the token that produced it.
        let not_modified = matches!(fetched.data, RawData::NotModified);
        let continuation = fetched
            .continuation
            .or_else(|| not_modified.then(|| tracker.continuation.clone()).flatten());
        Ok(Completed {
            updates: count,
            expires_at: fetched.expires_at,
            continuation,
        })
    }

    /// Finishes a tracker without calling the remote.
    fn refuse(
        &self,
        tracker: &Tracker,
        status: FinishedStatus,
        detail: String,
        now: Timestamp,
    ) -> Result<SyncOutcome, SyncError> {
        info!("not running: {detail}");
        match self.trackers.finish(tracker, status, detail.clone(), now)? {
            FinishOutcome::Finished(_) => Ok(SyncOutcome::Finished {
                status,
                detail,
                updates: 0,
                next_run: None,
            }),
            FinishOutcome::RaceLost => Ok(SyncOutcome::RaceLost),
        }
    }

    fn reschedule(
        &self,
        adapter: &dyn EndpointAdapter,
        target_id: TargetId,
        expires_at: Option<Timestamp>,
        continuation: Option<String>,
        now: Timestamp,
    ) -> Option<Timestamp> {
        // Re-resolve: scope or credentials may have changed during the attempt.
        let target = match self.targets.resolve(target_id) {
            Ok(Some(target)) => target,
            Ok(None) => return None,
            Err(e) => {
                warn!("could not re-resolve {target_id} for rescheduling: {e}");
                return None;
            }
        };
        if !self.should_reschedule(&target, adapter) {
            info!("not rescheduling");
            return None;
        }
        let next = expires_at
            .filter(|t| *t >= 0)
            .unwrap_or_else(|| now.saturating_add(millis(self.options.default_delay)));
        match self
            .trackers
            .schedule(target_id, &adapter.endpoint().id, next, continuation)
        {
            Ok(tracker) => Some(tracker.scheduled_at),
            Err(e) => {
                warn!("failed to schedule next attempt: {e}");
                None
            }
        }
    }
}
