//! End-to-end scheduler cycles over the in-memory stores.
//!
//! A fake clock drives time and scripted dispatchers stand in for the
//! network, so each test exercises a full claim → run → record → plan →
//! write-back cycle deterministically.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use engine_core::kernel::{Clock, FakeClock, UtcCron};
use engine_core::scheduler::{
    Dispatcher, Endpoint, EndpointStore, ExecutionResult, InMemoryEndpointStore, InMemoryRunStore,
    RunSource, RunStatus, RunStore, SchedulerConfig, SchedulerWorker, ZombieSweeper,
    ZombieSweeperConfig,
};

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
}

struct Fixture {
    clock: FakeClock,
    endpoints: Arc<InMemoryEndpointStore>,
    runs: Arc<InMemoryRunStore>,
}

impl Fixture {
    fn new(now: DateTime<Utc>) -> Self {
        let clock = FakeClock::at(now);
        let endpoints = Arc::new(InMemoryEndpointStore::new(Arc::new(clock.clone())));
        let runs = Arc::new(InMemoryRunStore::new(Arc::new(clock.clone())));
        Self {
            clock,
            endpoints,
            runs,
        }
    }

    fn worker(&self, dispatcher: Arc<dyn Dispatcher>) -> SchedulerWorker {
        SchedulerWorker::new(
            self.endpoints.clone(),
            self.runs.clone(),
            dispatcher,
            Arc::new(self.clock.clone()),
            Arc::new(UtcCron),
            SchedulerConfig::with_worker_id("test-worker"),
        )
    }

    async fn insert_endpoint(&self, build: impl FnOnce(&mut Endpoint)) -> Endpoint {
        let mut ep = Endpoint::builder()
            .tenant_id("tenant-1")
            .name("probe")
            .url("https://api.example.com/health")
            .next_run_at(self.clock.now())
            .build();
        build(&mut ep);
        self.endpoints.insert(&ep).await.unwrap();
        ep
    }
}

// =============================================================================
// Scripted dispatchers
// =============================================================================

/// Responds with a fixed result, optionally advancing the clock first to
/// simulate execution time.
struct ScriptedDispatcher {
    clock: FakeClock,
    execution_ms: i64,
    status_code: i32,
}

impl ScriptedDispatcher {
    fn ok(clock: FakeClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            execution_ms: 50,
            status_code: 200,
        })
    }

    fn failing(clock: FakeClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            execution_ms: 50,
            status_code: 500,
        })
    }

    fn slow(clock: FakeClock, execution_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            clock,
            execution_ms,
            status_code: 200,
        })
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn execute(&self, _endpoint: &Endpoint) -> ExecutionResult {
        self.clock.advance(Duration::milliseconds(self.execution_ms));
        let success = (200..300).contains(&self.status_code);
        ExecutionResult {
            status: if success {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            duration_ms: self.execution_ms,
            status_code: Some(self.status_code),
            response_body: Some(r#"{"ok":true}"#.to_string()),
            error_message: (!success).then(|| format!("endpoint returned HTTP {}", self.status_code)),
        }
    }
}

/// Writes an interval hint to the endpoint mid-execution, like the AI
/// planner racing the scheduler.
struct HintingDispatcher {
    clock: FakeClock,
    endpoints: Arc<InMemoryEndpointStore>,
    hint_interval_ms: i64,
}

#[async_trait]
impl Dispatcher for HintingDispatcher {
    async fn execute(&self, endpoint: &Endpoint) -> ExecutionResult {
        let now = self.clock.now();
        self.endpoints
            .apply_interval_hint(
                endpoint.id,
                self.hint_interval_ms,
                "mid-flight adjustment",
                now + Duration::hours(1),
            )
            .await
            .unwrap();
        self.clock.advance(Duration::milliseconds(20));

        ExecutionResult {
            status: RunStatus::Success,
            duration_ms: 20,
            status_code: Some(200),
            response_body: None,
            error_message: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_successful_cycle_records_run_and_reschedules() {
    let start = at(0, 0, 0);
    let fixture = Fixture::new(start);
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
            ep.failure_count = 2;
        })
        .await;

    let worker = fixture.worker(ScriptedDispatcher::ok(fixture.clock.clone()));
    assert_eq!(worker.tick().await.unwrap(), 1);

    // Run recorded with the streak-relative attempt and a terminal status.
    let runs = fixture.runs.all().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].endpoint_id, ep.id);
    assert_eq!(runs[0].attempt, 3);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].status_code, Some(200));
    assert_eq!(runs[0].source, RunSource::Scheduler);

    // Endpoint rescheduled one interval after the run start, unlocked,
    // streak reset.
    let updated = fixture.endpoints.snapshot(ep.id).await.unwrap();
    assert_eq!(updated.failure_count, 0);
    assert_eq!(updated.last_run_at, Some(start));
    assert_eq!(updated.next_run_at, Some(start + Duration::milliseconds(60_000)));
    assert!(updated.locked_by.is_none());
    assert!(updated.lock_expires_at.is_none());
}

#[tokio::test]
async fn test_failed_cycle_increments_failure_count() {
    let fixture = Fixture::new(at(0, 0, 0));
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
        })
        .await;

    let worker = fixture.worker(ScriptedDispatcher::failing(fixture.clock.clone()));
    worker.tick().await.unwrap();

    let runs = fixture.runs.all().await;
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].status_code, Some(500));
    assert!(runs[0].error_message.as_deref().unwrap().contains("500"));

    let updated = fixture.endpoints.snapshot(ep.id).await.unwrap();
    assert_eq!(updated.failure_count, 1);

    // Next cycle's run carries attempt 2.
    fixture.clock.set(updated.next_run_at.unwrap());
    let worker = fixture.worker(ScriptedDispatcher::failing(fixture.clock.clone()));
    worker.tick().await.unwrap();

    let runs = fixture.runs.all().await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].attempt, 2);
    assert_eq!(
        fixture.endpoints.snapshot(ep.id).await.unwrap().failure_count,
        2
    );
}

#[tokio::test]
async fn test_past_time_guard_on_long_run() {
    // Execution (25s) outruns the 10s interval; the endpoint must not be
    // immediately re-claimable.
    let start = at(0, 0, 0);
    let fixture = Fixture::new(start);
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(10_000);
        })
        .await;

    let worker = fixture.worker(ScriptedDispatcher::slow(fixture.clock.clone(), 25_000));
    worker.tick().await.unwrap();

    let finish = start + Duration::milliseconds(25_000);
    assert_eq!(fixture.clock.now(), finish);

    let next_run_at = fixture
        .endpoints
        .snapshot(ep.id)
        .await
        .unwrap()
        .next_run_at
        .unwrap();
    assert!(next_run_at >= finish + Duration::seconds(1));
    assert!(next_run_at <= finish + Duration::milliseconds(10_000));

    // Nothing is due right after the long run.
    assert_eq!(worker.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_hint_written_during_execution_is_planned() {
    let start = at(0, 0, 0);
    let fixture = Fixture::new(start);
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(600_000);
        })
        .await;

    let dispatcher = Arc::new(HintingDispatcher {
        clock: fixture.clock.clone(),
        endpoints: fixture.endpoints.clone(),
        hint_interval_ms: 30_000,
    });
    let worker = fixture.worker(dispatcher);
    worker.tick().await.unwrap();

    // The re-read after execution observed the hint: 30s, not 10min.
    let updated = fixture.endpoints.snapshot(ep.id).await.unwrap();
    assert_eq!(updated.next_run_at, Some(start + Duration::milliseconds(30_000)));
    assert_eq!(updated.ai_hint_interval_ms, Some(30_000));
}

#[tokio::test]
async fn test_expired_hint_cleared_by_post_run_update() {
    let start = at(1, 0, 0);
    let fixture = Fixture::new(start);
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
            ep.ai_hint_interval_ms = Some(5_000);
            ep.ai_hint_reason = Some("stale".to_string());
            ep.ai_hint_expires_at = Some(at(0, 30, 0)); // dead before the run
        })
        .await;

    let worker = fixture.worker(ScriptedDispatcher::ok(fixture.clock.clone()));
    worker.tick().await.unwrap();

    let updated = fixture.endpoints.snapshot(ep.id).await.unwrap();
    // Dead hint neither influenced the plan nor survived the update.
    assert_eq!(updated.next_run_at, Some(start + Duration::milliseconds(60_000)));
    assert!(updated.ai_hint_interval_ms.is_none());
    assert!(updated.ai_hint_expires_at.is_none());
}

#[tokio::test]
async fn test_paused_endpoint_waits_until_resume() {
    let start = at(0, 0, 0);
    let fixture = Fixture::new(start);
    let resume = at(2, 0, 0);
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
            ep.paused_until = Some(resume);
        })
        .await;

    // The pause is observed at plan time: the due endpoint still runs
    // once, then parks at paused_until.
    let worker = fixture.worker(ScriptedDispatcher::ok(fixture.clock.clone()));
    worker.tick().await.unwrap();

    let updated = fixture.endpoints.snapshot(ep.id).await.unwrap();
    assert_eq!(updated.next_run_at, Some(resume));

    // Not claimable again before the pause lifts.
    fixture.clock.set(at(1, 0, 0));
    assert_eq!(worker.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_archived_endpoints_are_never_claimed() {
    let fixture = Fixture::new(at(0, 0, 0));
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
        })
        .await;
    fixture.endpoints.archive(ep.id).await.unwrap();

    let worker = fixture.worker(ScriptedDispatcher::ok(fixture.clock.clone()));
    assert_eq!(worker.tick().await.unwrap(), 0);
    assert!(fixture.runs.all().await.is_empty());
}

#[tokio::test]
async fn test_batch_size_bounds_each_tick() {
    let fixture = Fixture::new(at(0, 0, 0));
    for i in 0..5 {
        fixture
            .insert_endpoint(|ep| {
                ep.name = format!("probe-{}", i);
                ep.baseline_interval_ms = Some(60_000);
            })
            .await;
    }

    let dispatcher = ScriptedDispatcher::ok(fixture.clock.clone());
    let worker = SchedulerWorker::new(
        fixture.endpoints.clone(),
        fixture.runs.clone(),
        dispatcher,
        Arc::new(fixture.clock.clone()),
        Arc::new(UtcCron),
        SchedulerConfig {
            batch_size: 2,
            ..SchedulerConfig::with_worker_id("test-worker")
        },
    );

    assert_eq!(worker.tick().await.unwrap(), 2);
    assert_eq!(worker.tick().await.unwrap(), 2);
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(fixture.runs.all().await.len(), 5);
}

#[tokio::test]
async fn test_zombie_sweeper_reaps_orphaned_runs() {
    let fixture = Fixture::new(at(0, 0, 0));
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
        })
        .await;

    // A run opened but never finished, as after a worker crash.
    let run_id = fixture
        .runs
        .create(engine_core::scheduler::NewRun {
            endpoint_id: ep.id,
            attempt: 1,
            source: RunSource::Scheduler,
        })
        .await
        .unwrap();

    fixture.clock.advance(Duration::minutes(10));

    let reaped = fixture.runs.cleanup_zombies(300_000).await.unwrap();
    assert_eq!(reaped, 1);
    let run = fixture.runs.snapshot(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(run.error_message.as_deref().unwrap().contains("zombie"));
}

#[tokio::test]
async fn test_zombie_sweeper_service_loop_runs_on_cadence() {
    let fixture = Fixture::new(at(0, 0, 0));
    let ep = fixture
        .insert_endpoint(|ep| {
            ep.baseline_interval_ms = Some(60_000);
        })
        .await;

    let run_id = fixture
        .runs
        .create(engine_core::scheduler::NewRun {
            endpoint_id: ep.id,
            attempt: 1,
            source: RunSource::Scheduler,
        })
        .await
        .unwrap();

    let sweeper = ZombieSweeper::new(
        fixture.runs.clone(),
        Arc::new(fixture.clock.clone()),
        ZombieSweeperConfig {
            zombie_threshold_ms: 300_000,
            sweep_interval_ms: 150_000,
        },
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // Let the sweeper loop past the threshold (the fake clock advances on
    // every sleep), then stop it.
    for _ in 0..50 {
        tokio::task::yield_now().await;
        if fixture.runs.snapshot(run_id).await.unwrap().status == RunStatus::Canceled {
            break;
        }
    }
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(
        fixture.runs.snapshot(run_id).await.unwrap().status,
        RunStatus::Canceled
    );
}
