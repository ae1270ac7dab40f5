use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chronicle_config::EndpointSpec;
use chronicle_core::{
    tracker::EXCESSIVE_DELAY_DETAIL, Endpoint, EndpointId, Fact, FinishedStatus, NaturalKey,
    RecordId, Target, TargetId, Timestamp, TrackerStatus, Update,
};
use chronicle_infra::{ApiClient, ErrorBudget, RateLimiterRegistry};
use chronicle_persistence::{
    RecordStore, RedbStore, StorageError, TargetDirectory, TrackerStore,
};
use chronicle_pipeline::{
    Clock, EndpointAdapter, ErrorInfo, FetchError, Fetched, JsonEndpointAdapter, ProcessContext,
    ProcessingError, RawData, SyncEngine, SyncOptions, SyncOutcome,
};
use serde_json::{json, Value};

const ACCOUNT: TargetId = TargetId::Account(42);
const NOW: Timestamp = 1_000;

struct ManualClock(AtomicI64);

impl ManualClock {
    fn at(now: Timestamp) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(now)))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

type FetchHook = Box<dyn Fn() + Send + Sync>;

/// Serves a canned fetch result and processes it like the JSON adapter does.
struct FakeAdapter {
    inner: JsonEndpointAdapter,
    endpoint: Endpoint,
    response: Mutex<Result<Fetched, FetchError>>,
    fetch_calls: AtomicUsize,
    seen_continuation: Mutex<Option<String>>,
    on_fetch: Option<FetchHook>,
}

impl FakeAdapter {
    fn new(endpoint: Endpoint, response: Result<Fetched, FetchError>) -> Self {
        let mut spec = EndpointSpec::new(endpoint.id.as_str(), "http://127.0.0.1:1/{target}");
        spec.required_scope = endpoint.required_scope.clone();
        let limiter = Arc::new(RateLimiterRegistry::default());
        let client = ApiClient::new(reqwest::Client::new(), limiter);
        Self {
            inner: JsonEndpointAdapter::new(spec, Arc::new(client)),
            endpoint,
            response: Mutex::new(response),
            fetch_calls: AtomicUsize::new(0),
            seen_continuation: Mutex::new(None),
            on_fetch: None,
        }
    }

    fn serving(endpoint: Endpoint, body: Value, expires_at: Option<Timestamp>) -> Self {
        Self::new(
            endpoint,
            Ok(Fetched {
                data: RawData::Json(body),
                expires_at,
                continuation: Some("\"etag-1\"".into()),
            }),
        )
    }

    fn with_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_fetch = Some(Box::new(hook));
        self
    }

    fn calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EndpointAdapter for FakeAdapter {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn fetch(
        &self,
        _target: &Target,
        continuation: Option<&str>,
    ) -> Result<Fetched, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_continuation.lock().unwrap() = continuation.map(str::to_string);
        if let Some(hook) = &self.on_fetch {
            hook();
        }
        tokio::task::yield_now().await;
        self.response.lock().unwrap().clone()
    }

    fn process(
        &self,
        ctx: &ProcessContext<'_>,
        data: &RawData,
    ) -> Result<Vec<Update<Fact>>, ProcessingError> {
        self.inner.process(ctx, data)
    }
}

struct Fixture {
    store: Arc<RedbStore>,
    clock: Arc<ManualClock>,
    engine: SyncEngine,
}

fn options() -> SyncOptions {
    SyncOptions {
        max_delay: Duration::from_secs(60),
        default_delay: Duration::from_secs(10),
        batch_size: 200,
        ..SyncOptions::default()
    }
}

fn fixture_with(options: SyncOptions) -> Fixture {
    let store = Arc::new(RedbStore::in_memory().unwrap());
    store
        .upsert_target(&Target::new(ACCOUNT).with_scopes(["read_assets"]))
        .unwrap();
    let clock = ManualClock::at(NOW);
    let engine = SyncEngine::from_store(store.clone(), Arc::new(ErrorBudget::default()), options)
        .with_clock(clock.clone());
    Fixture {
        store,
        clock,
        engine,
    }
}

fn fixture() -> Fixture {
    fixture_with(options())
}

fn assets() -> Endpoint {
    Endpoint::new("assets").with_scope("read_assets")
}

fn assets_id() -> EndpointId {
    EndpointId::new("assets")
}

fn two_items() -> Value {
    json!([{ "id": 1, "qty": 5 }, { "id": 2, "qty": 7 }])
}

#[tokio::test]
async fn scenario_a_no_tracker_is_a_no_op() {
    let f = fixture();
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert_eq!(outcome, SyncOutcome::Idle);
    assert_eq!(adapter.calls(), 0);
    assert!(f.store.get_all_live("assets", ACCOUNT, NOW).unwrap().is_empty());
}

#[tokio::test]
async fn scenario_b_success_inserts_and_reschedules_at_expiry() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::serving(assets(), two_items(), Some(1238));

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert_eq!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::Success,
            detail: "updated successfully".into(),
            updates: 2,
            next_run: Some(1238),
        }
    );
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.status, TrackerStatus::Finished(FinishedStatus::Success));
    assert_eq!(last.detail, "updated successfully");
    assert_eq!(last.sync_started_at, Some(NOW));

    let next = f.store.unfinished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(next.status, TrackerStatus::Scheduled);
    assert_eq!(next.scheduled_at, 1238);
    assert_eq!(next.continuation.as_deref(), Some("\"etag-1\""));

    let live = f.store.get_all_live("assets", ACCOUNT, NOW).unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|fact| fact.life.start == NOW && fact.life.is_live()));
}

#[tokio::test(start_paused = true)]
async fn scenario_c_client_error_feeds_budget_and_reschedules_with_default_delay() {
    let f = fixture();
    f.store
        .create_scheduled(ACCOUNT, &assets_id(), 0, Some("\"old\"".into()))
        .unwrap();
    let adapter = FakeAdapter::new(
        assets(),
        Err(FetchError::Client(ErrorInfo {
            status: 403,
            message: "token not valid for scope".into(),
            remaining: Some(2),
            reset_secs: Some(30),
        })),
    );

    let started = tokio::time::Instant::now();
    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    // ErrorBudget default: threshold 10, margin 1s.
    assert!(started.elapsed() >= Duration::from_secs(31));
    match outcome {
        SyncOutcome::Finished {
            status, next_run, ..
        } => {
            assert_eq!(status, FinishedStatus::Error);
            assert_eq!(next_run, Some(NOW + 10_000));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.detail, "client error: 403 token not valid for scope");
    assert_eq!(last.continuation, None);

    let next = f.store.unfinished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(next.scheduled_at, NOW + 10_000);
    assert_eq!(next.continuation, None);
}

#[tokio::test]
async fn scenario_d_lost_scope_stops_rescheduling() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let directory = f.store.clone();
    let adapter = FakeAdapter::serving(assets(), two_items(), Some(5_000)).with_hook(move || {
        directory.upsert_target(&Target::new(ACCOUNT)).unwrap();
    });

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    match outcome {
        SyncOutcome::Finished {
            status, next_run, ..
        } => {
            assert_eq!(status, FinishedStatus::Success);
            assert_eq!(next_run, None);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_none());
}

/// Delegates to redb while counting transactions.
struct CountingRecords {
    inner: Arc<RedbStore>,
    transactions: AtomicUsize,
}

impl RecordStore for CountingRecords {
    fn get(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
        at: Timestamp,
    ) -> Result<Option<Fact>, StorageError> {
        self.inner.get(kind, target, key, at)
    }

    fn live_page(
        &self,
        kind: &str,
        target: TargetId,
        at: Timestamp,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Fact>, StorageError> {
        self.inner.live_page(kind, target, at, after, limit)
    }

    fn versions(
        &self,
        kind: &str,
        target: TargetId,
        key: &NaturalKey,
    ) -> Result<Vec<Fact>, StorageError> {
        self.inner.versions(kind, target, key)
    }

    fn apply(&self, updates: &[Update<Fact>]) -> Result<(), StorageError> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(updates)
    }

    fn retire_target(&self, target: TargetId, at: Timestamp) -> Result<usize, StorageError> {
        self.inner.retire_target(target, at)
    }
}

#[tokio::test]
async fn scenario_e_large_update_lists_commit_in_batches() {
    let store = Arc::new(RedbStore::in_memory().unwrap());
    store
        .upsert_target(&Target::new(ACCOUNT).with_scopes(["read_assets"]))
        .unwrap();
    store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let records = Arc::new(CountingRecords {
        inner: store.clone(),
        transactions: AtomicUsize::new(0),
    });
    let engine = SyncEngine::new(
        store.clone(),
        store.clone(),
        records.clone(),
        Arc::new(ErrorBudget::default()),
        options(),
    )
    .with_clock(ManualClock::at(NOW));

    let items: Vec<Value> = (0..1500).map(|i| json!({ "id": i, "qty": i })).collect();
    let adapter = FakeAdapter::serving(assets(), Value::Array(items), None);

    let outcome = engine.synch(&adapter, ACCOUNT).await;

    assert!(matches!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::Success,
            updates: 1500,
            ..
        }
    ));
    assert_eq!(records.transactions.load(Ordering::SeqCst), 8);
    assert_eq!(store.get_all_live("assets", ACCOUNT, NOW).unwrap().len(), 1500);
}

#[tokio::test]
async fn stale_running_tracker_is_expired_without_a_successor() {
    let f = fixture();
    let t = f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    f.store.start_tracker(&t, NOW).unwrap();
    f.clock.0.store(NOW + 60_001, Ordering::SeqCst);
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert_eq!(outcome, SyncOutcome::Expired);
    assert_eq!(adapter.calls(), 0);
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.status, TrackerStatus::Finished(FinishedStatus::Warning));
    assert_eq!(last.detail, EXCESSIVE_DELAY_DETAIL);
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_none());
}

#[tokio::test]
async fn resync_with_changes_supersedes_and_retires() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let first = FakeAdapter::serving(assets(), two_items(), None);
    f.engine.synch(&first, ACCOUNT).await;

    f.clock.0.store(NOW + 20_000, Ordering::SeqCst);
    let second = FakeAdapter::serving(
        assets(),
        json!([{ "id": 1, "qty": 6 }, { "id": 3, "qty": 1 }]),
        None,
    );
    let outcome = f.engine.synch(&second, ACCOUNT).await;

    // 1 supersede, 1 insert, 1 retire
    assert!(matches!(outcome, SyncOutcome::Finished { updates: 3, .. }));
    assert_eq!(
        *second.seen_continuation.lock().unwrap(),
        Some("\"etag-1\"".to_string())
    );

    let versions = f
        .store
        .versions("assets", ACCOUNT, &NaturalKey::new("1"))
        .unwrap();
    let lives: Vec<_> = versions.iter().map(|v| (v.life.start, v.life.end)).collect();
    assert_eq!(lives, vec![(NOW, NOW + 20_000), (NOW + 20_000, i64::MAX)]);

    let gone = f.store.get("assets", ACCOUNT, &NaturalKey::new("2"), NOW + 20_000).unwrap();
    assert!(gone.is_none());
    let then = f.store.get("assets", ACCOUNT, &NaturalKey::new("2"), NOW).unwrap().unwrap();
    assert_eq!(then.attributes["qty"], json!(7));
}

#[tokio::test]
async fn unmet_prerequisites_leave_the_tracker_scheduled() {
    let f = fixture();
    let names = Endpoint::new("asset_names").with_prerequisite("assets");
    let names_id = EndpointId::new("asset_names");
    f.store.create_scheduled(ACCOUNT, &names_id, 0, None).unwrap();
    let adapter = FakeAdapter::serving(names, json!([]), None);

    assert_eq!(f.engine.synch(&adapter, ACCOUNT).await, SyncOutcome::Blocked);
    let tracker = f.store.unfinished(ACCOUNT, &names_id).unwrap().unwrap();
    assert_eq!(tracker.status, TrackerStatus::Scheduled);
    assert_eq!(adapter.calls(), 0);

    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let assets_adapter = FakeAdapter::serving(assets(), two_items(), None);
    f.engine.synch(&assets_adapter, ACCOUNT).await;

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;
    assert!(matches!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::Success,
            ..
        }
    ));
}

#[tokio::test]
async fn tracker_replaced_mid_attempt_is_a_lost_race() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let trackers = f.store.clone();
    let adapter = FakeAdapter::serving(assets(), two_items(), None).with_hook(move || {
        let mut current = trackers.unfinished(ACCOUNT, &assets_id()).unwrap().unwrap();
        current.finish(FinishedStatus::Error, "finished by another worker", NOW);
        trackers.finish_tracker(&current).unwrap();
    });

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert_eq!(outcome, SyncOutcome::RaceLost);
    let history = f.store.history(ACCOUNT, &assets_id(), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].detail, "finished by another worker");
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_none());
}

#[tokio::test]
async fn concurrent_attempts_finish_the_tracker_once() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    let (a, b) = tokio::join!(
        f.engine.synch(&adapter, ACCOUNT),
        f.engine.synch(&adapter, ACCOUNT)
    );

    let finished = [&a, &b]
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Finished { .. }))
        .count();
    assert_eq!(finished, 1, "outcomes: {a:?} / {b:?}");
    assert_eq!(f.store.history(ACCOUNT, &assets_id(), 10).unwrap().len(), 1);
    assert_eq!(f.store.list_unfinished().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_scope_at_pickup_is_not_allowed() {
    let f = fixture();
    f.store.upsert_target(&Target::new(ACCOUNT)).unwrap();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert_eq!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::NotAllowed,
            detail: "missing scope read_assets".into(),
            updates: 0,
            next_run: None,
        }
    );
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn excluded_endpoint_is_finished_excluded() {
    let mut opts = options();
    opts.excluded.insert("assets".into());
    let f = fixture_with(opts);
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert!(matches!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::Excluded,
            next_run: None,
            ..
        }
    ));
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_none());
}

#[tokio::test]
async fn deleted_target_closes_its_tracker() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    f.store.remove_target(ACCOUNT).unwrap();
    let adapter = FakeAdapter::serving(assets(), two_items(), None);

    assert_eq!(f.engine.synch(&adapter, ACCOUNT).await, SyncOutcome::TargetGone);
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.status, TrackerStatus::Finished(FinishedStatus::Error));
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_none());
}

#[tokio::test]
async fn transport_and_processing_errors_get_distinct_details() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let down = FakeAdapter::new(assets(), Err(FetchError::Transport("connection refused".into())));
    f.engine.synch(&down, ACCOUNT).await;
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.detail, "transport error: connection refused");

    // Rescheduled at now + default delay; make it due.
    f.clock.0.store(NOW + 10_000, Ordering::SeqCst);
    let garbage = FakeAdapter::serving(assets(), json!([{ "no_id": true }]), None);
    f.engine.synch(&garbage, ACCOUNT).await;
    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert!(last.detail.starts_with("processing error: "), "{}", last.detail);
    assert!(f.store.unfinished(ACCOUNT, &assets_id()).unwrap().is_some());
}

#[tokio::test]
async fn non_json_success_body_is_a_processing_error() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::new(
        assets(),
        Ok(Fetched {
            data: RawData::Undecodable("invalid JSON from upstream: expected value".into()),
            expires_at: None,
            continuation: None,
        }),
    );

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    match outcome {
        SyncOutcome::Finished { status, detail, .. } => {
            assert_eq!(status, FinishedStatus::Error);
            assert_eq!(detail, "processing error: invalid JSON from upstream: expected value");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn null_body_keeps_live_records() {
    let f = fixture();
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    f.engine
        .synch(&FakeAdapter::serving(assets(), two_items(), None), ACCOUNT)
        .await;

    f.clock.0.store(NOW + 10_000, Ordering::SeqCst);
    let empty = FakeAdapter::serving(assets(), Value::Null, None);
    f.engine.synch(&empty, ACCOUNT).await;

    let last = f.store.last_finished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(last.status, TrackerStatus::Finished(FinishedStatus::Error));
    assert!(last.detail.starts_with("processing error: "), "{}", last.detail);
    let live = f.store.get_all_live("assets", ACCOUNT, NOW + 10_000).unwrap();
    assert_eq!(live.len(), 2);
}

#[tokio::test]
async fn duplicate_keys_in_one_snapshot_fail_the_commit() {
    let mut opts = options();
    opts.batch_size = 1;
    let f = fixture_with(opts);
    f.store.create_scheduled(ACCOUNT, &assets_id(), 0, None).unwrap();
    let adapter = FakeAdapter::serving(
        assets(),
        json!([{ "id": 1, "qty": 1 }, { "id": 1, "qty": 2 }]),
        None,
    );

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    match outcome {
        SyncOutcome::Finished { status, detail, .. } => {
            assert_eq!(status, FinishedStatus::Error);
            assert!(detail.starts_with("commit error: chunk 2 of 2"), "{detail}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // The first chunk stays committed.
    let live = f.store.get_all_live("assets", ACCOUNT, NOW).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].attributes["qty"], json!(1));
}

#[tokio::test]
async fn not_modified_keeps_records_and_continuation() {
    let f = fixture();
    f.store
        .create_scheduled(ACCOUNT, &assets_id(), 0, Some("\"etag-0\"".into()))
        .unwrap();
    let adapter = FakeAdapter::new(
        assets(),
        Ok(Fetched {
            data: RawData::NotModified,
            expires_at: Some(9_000),
            continuation: None,
        }),
    );

    let outcome = f.engine.synch(&adapter, ACCOUNT).await;

    assert!(matches!(
        outcome,
        SyncOutcome::Finished {
            status: FinishedStatus::Success,
            updates: 0,
            next_run: Some(9_000),
            ..
        }
    ));
    let next = f.store.unfinished(ACCOUNT, &assets_id()).unwrap().unwrap();
    assert_eq!(next.continuation.as_deref(), Some("\"etag-0\""));
}
