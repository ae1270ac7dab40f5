use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chronicle_config::EngineConfig;
use chronicle_core::{EndpointId, FinishedStatus, Timestamp};
use chronicle_infra::{ApiClient, RateLimiterRegistry};
use chronicle_persistence::StorageError;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::adapter::{EndpointAdapter, JsonEndpointAdapter};
use crate::sync::{SyncEngine, SyncOutcome};

/// Adapters by endpoint name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<EndpointId, Arc<dyn EndpointAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One JSON adapter per configured endpoint, sharing `client`.
    pub fn from_config(config: &EngineConfig, client: Arc<ApiClient>) -> Self {
        let mut registry = Self::new();
        for spec in &config.endpoints {
            registry.register(Arc::new(JsonEndpointAdapter::new(spec.clone(), client.clone())));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn EndpointAdapter>) {
        self.adapters.insert(adapter.endpoint().id.clone(), adapter);
    }

    pub fn get(&self, endpoint: &EndpointId) -> Option<&Arc<dyn EndpointAdapter>> {
        self.adapters.get(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EndpointAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Idle, blocked, raced or expired pairs.
    pub skipped: usize,
    /// Due trackers whose endpoint has no registered adapter.
    pub unknown_endpoints: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: Option<SyncOutcome>) {
        match outcome {
            None => self.unknown_endpoints += 1,
            Some(outcome) => {
                self.attempted += 1;
                match outcome {
                    SyncOutcome::Finished {
                        status: FinishedStatus::Success,
                        ..
                    } => self.succeeded += 1,
                    SyncOutcome::Finished { .. } | SyncOutcome::Aborted(_) => self.failed += 1,
                    _ => self.skipped += 1,
                }
            }
        }
    }
}

/// Runs every due tracker with bounded concurrency.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    adapters: Arc<AdapterRegistry>,
    concurrency: usize,
    limiter: Option<Arc<RateLimiterRegistry>>,
    bucket_ttl: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        adapters: Arc<AdapterRegistry>,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            adapters,
            concurrency: concurrency.max(1),
            limiter: None,
            bucket_ttl: Duration::from_secs(chronicle_config::DEFAULT_BUCKET_TTL_SECS),
        }
    }

    /// Evict rate buckets idle for `ttl` after every tick of [`Scheduler::run_forever`].
    pub fn with_rate_buckets(mut self, limiter: Arc<RateLimiterRegistry>, ttl: Duration) -> Self {
        self.limiter = Some(limiter);
        self.bucket_ttl = ttl;
        self
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Ensures every eligible (active target, endpoint) pair has an unfinished
    /// tracker. Existing trackers are left alone. Returns the pairs covered.
    pub fn bootstrap(&self) -> Result<usize, StorageError> {
        let now = self.engine.now();
        let mut covered = 0;
        for target in self.engine.targets().list_targets()? {
            for adapter in self.adapters.iter() {
                if !self.engine.should_reschedule(&target, &**adapter) {
                    continue;
                }
                self.engine
                    .trackers()
                    .schedule(target.id, &adapter.endpoint().id, now, None)?;
                covered += 1;
            }
        }
        debug!("bootstrap covered {covered} pairs");
        Ok(covered)
    }

    pub async fn run_due(&self, now: Timestamp) -> Result<RunSummary, StorageError> {
        let due = self.engine.trackers().store().due(now)?;
        if due.is_empty() {
            return Ok(RunSummary::default());
        }
        info!("{} trackers due", due.len());

        let engine = &*self.engine;
        let adapters = &*self.adapters;
        let outcomes: Vec<Option<SyncOutcome>> = stream::iter(due)
            .map(|tracker| async move {
                match adapters.get(&tracker.endpoint) {
                    Some(adapter) => Some(engine.synch(&**adapter, tracker.target).await),
                    None => {
                        warn!("no adapter registered for endpoint {}", tracker.endpoint);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        Ok(summary)
    }

    /// Bootstraps and runs due trackers every `poll_interval` until `shutdown` resolves.
    pub async fn run_forever<F>(&self, poll_interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.bootstrap() {
                        warn!("bootstrap failed: {e}");
                    }
                    match self.run_due(self.engine.now()).await {
                        Ok(summary) if summary.attempted > 0 => info!(
                            "tick: {} attempted, {} succeeded, {} failed, {} skipped",
                            summary.attempted, summary.succeeded, summary.failed, summary.skipped
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("listing due trackers failed: {e}"),
                    }
                    if let Some(limiter) = &self.limiter {
                        let evicted = limiter.evict_idle(self.bucket_ttl);
                        if evicted > 0 {
                            debug!("evicted {evicted} idle rate buckets");
                        }
                    }
                }
            }
        }
    }
}
