use std::sync::Arc;
use std::time::Duration;

use ferry_config::ShareType;
use ferry_core::{
    CompletionCallback, ErrorKind, LocalUser, MoverRegistry, RequestState, Stage,
    TransferParameters, TransferRequest,
};
use ferry_events::{Event, EventBus};
use ferry_scheduler::{
    RetryPolicy, Scheduler, SchedulerConfig, SchedulerContext, SchedulerError,
    ShareConfiguration, SlotLimits, UrlMap,
};
use ferry_telemetry::Metrics;
use ferry_test_support::fixtures::{mock_request, wait_until};
use ferry_test_support::mocks::{RecordingCallback, ScriptedMover, Step};

const SETTLE: Duration = Duration::from_secs(5);

struct Harness {
    scheduler: Scheduler,
    events: EventBus,
    metrics: Metrics,
    recorder: Arc<RecordingCallback>,
}

impl Harness {
    fn start(mover: &Arc<ScriptedMover>, configure: impl FnOnce(&mut SchedulerConfig)) -> Self {
        let mut config = SchedulerConfig {
            slots: SlotLimits {
                pre_processor: 20,
                delivery: 10,
                post_processor: 20,
                emergency: 0,
                staged_prepared: 200,
            },
            retry: RetryPolicy::fixed(Duration::from_millis(10)),
            tick_interval: Duration::from_millis(10),
            monitor_interval: Duration::from_millis(20),
            cancel_grace: Duration::from_millis(500),
            ..SchedulerConfig::default()
        };
        configure(&mut config);
        let events = EventBus::new();
        let metrics = Metrics::new().expect("metrics registry");
        let movers = MoverRegistry::new().with(Arc::clone(mover) as _);
        let scheduler = Scheduler::start(
            config,
            SchedulerContext::new(events.clone(), metrics.clone(), movers),
        );
        Self {
            scheduler,
            events,
            metrics,
            recorder: RecordingCallback::new(),
        }
    }

    fn submit(&self, request: TransferRequest) {
        self.scheduler
            .submit(request.with_callback(Arc::clone(&self.recorder) as _))
            .expect("submit accepted");
    }
}

fn owned_by(user: &str, index: usize) -> TransferRequest {
    TransferRequest::new(
        "fairness",
        format!("mock://{user}/{index}"),
        format!("mock://destination/{user}/{index}"),
        LocalUser::new(user, 1000, 1000),
    )
}

#[tokio::test]
async fn requests_walk_every_stage_to_done() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |_| {});
    for index in 0..3 {
        harness.submit(mock_request("job-ok", &format!("mock://source/{index}")));
    }

    let finished = harness.recorder.wait_for(3, SETTLE).await;
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|f| f.state == RequestState::Done));
    assert!(finished.iter().all(|f| f.attempts == 3));

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.transfers_done, 3);
    assert_eq!(snapshot.bytes_transferred_total, 3 * 1_024);

    let kinds: Vec<&str> = harness
        .events
        .backlog_since(0)
        .iter()
        .map(|envelope| envelope.event.kind())
        .collect();
    assert_eq!(kinds.iter().filter(|kind| **kind == "request_submitted").count(), 3);
    assert_eq!(kinds.iter().filter(|kind| **kind == "request_finished").count(), 3);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn temporary_errors_exhaust_retries_after_exactly_three_attempts() {
    let mover = Arc::new(ScriptedMover::new());
    let source = "mock://source/flaky";
    mover.script(source, (0..10).map(|n| Step::Temporary(format!("timeout {n}"))));
    let harness = Harness::start(&mover, |_| {});
    harness.submit(mock_request("job-retry", source).with_retries(2));

    let finished = harness.recorder.wait_for(1, SETTLE).await;
    let record = finished.first().expect("request finished");
    assert_eq!(record.state, RequestState::Failed);
    assert_eq!(record.retries_remaining, 0);
    assert_eq!(mover.attempts(source), 3);
    let error = record.error.as_ref().expect("failure recorded");
    assert_eq!(error.kind(), ErrorKind::Permanent);
    assert!(error.message().contains("no retries left"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mover.attempts(source), 3);
    assert_eq!(harness.metrics.snapshot().retries_total, 2);
    let retries = harness
        .events
        .backlog_since(0)
        .into_iter()
        .filter(|envelope| matches!(envelope.event, Event::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn permanent_errors_fail_without_retrying() {
    let mover = Arc::new(ScriptedMover::new());
    let source = "mock://source/missing";
    mover.script(source, [Step::Permanent("no such file".into())]);
    let harness = Harness::start(&mover, |_| {});
    harness.submit(mock_request("job-perm", source).with_retries(5));

    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished[0].state, RequestState::Failed);
    assert_eq!(finished[0].retries_remaining, 5);
    assert_eq!(mover.attempts(source), 1);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn worker_panics_and_stalls_consume_a_retry() {
    let mover = Arc::new(ScriptedMover::new());
    mover.script("mock://source/panics", [Step::Panic("mover exploded".into())]);
    mover.script("mock://source/stalls", [Step::Stall]);
    let harness = Harness::start(&mover, |config| {
        config.transfer = TransferParameters {
            max_inactivity_time: Duration::from_millis(100),
            ..TransferParameters::default()
        };
    });
    harness.submit(mock_request("job-crash", "mock://source/panics"));
    harness.submit(mock_request("job-crash", "mock://source/stalls"));

    let finished = harness.recorder.wait_for(2, SETTLE).await;
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|f| f.state == RequestState::Done));
    assert!(finished.iter().all(|f| f.retries_remaining == 0));
    assert_eq!(mover.attempts("mock://source/panics"), 2);
    assert_eq!(mover.attempts("mock://source/stalls"), 2);

    assert!(harness.scheduler.is_running());
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn a_request_is_never_held_by_two_workers() {
    let mover = Arc::new(ScriptedMover::with_hold(Duration::from_millis(5)));
    for index in (0..30).step_by(3) {
        mover.script(
            &format!("mock://source/{index}"),
            [Step::Temporary("flaky".into())],
        );
    }
    let harness = Harness::start(&mover, |config| config.slots.delivery = 4);
    for index in 0..30 {
        harness.submit(mock_request("job-many", &format!("mock://source/{index}")));
    }

    let finished = harness.recorder.wait_for(30, SETTLE).await;
    assert_eq!(finished.len(), 30);
    assert!(finished.iter().all(|f| f.state == RequestState::Done));
    assert_eq!(mover.overlapping_holders(), 0);
    assert!(mover.max_concurrent() <= 4, "max {}", mover.max_concurrent());
    assert_eq!(harness.scheduler.slot_usage(Stage::Delivery).in_use, 0);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn last_retry_requests_use_emergency_slots() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |config| {
        config.slots.delivery = 0;
        config.slots.emergency = 1;
        config.emergency_threshold = Duration::from_millis(50);
    });
    harness.submit(mock_request("job-emergency", "mock://source/last-try"));
    harness.submit(mock_request("job-emergency", "mock://source/plenty").with_retries(3));

    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished[0].source, "mock://source/last-try");
    assert_eq!(finished[0].state, RequestState::Done);
    assert_eq!(harness.metrics.snapshot().emergency_admissions_total, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mover.attempts("mock://source/plenty"), 0);
    let snapshot = harness.scheduler.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stage(Stage::Delivery).map(|s| s.queued), Some(1));
    assert_eq!(snapshot.emergency.in_use, 0);

    harness.scheduler.stop(true).await.expect("stop");
    let finished = harness.recorder.finished();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[1].state, RequestState::Cancelled);
}

#[tokio::test]
async fn equal_shares_take_turns_on_a_single_slot() {
    let mover = Arc::new(ScriptedMover::with_hold(Duration::from_millis(15)));
    let harness = Harness::start(&mover, |config| config.slots.delivery = 1);
    for index in 0..20 {
        harness.submit(owned_by("alice", index));
    }
    for index in 0..20 {
        harness.submit(owned_by("bob", index));
    }

    let finished = harness.recorder.wait_for(40, Duration::from_secs(10)).await;
    assert_eq!(finished.len(), 40);
    let order = mover.start_order();
    let alice = order
        .iter()
        .take(20)
        .filter(|source| source.starts_with("mock://alice/"))
        .count();
    assert!((10..=12).contains(&alice), "alice served {alice} of the first 20: {order:?}");

    let owners: Vec<&str> = order
        .iter()
        .take(30)
        .map(|source| source.split('/').nth(2).unwrap_or_default())
        .collect();
    let longest_run = owners
        .chunk_by(|a, b| a == b)
        .map(<[&str]>::len)
        .max()
        .unwrap_or(0);
    assert!(longest_run <= 2, "one share ran {longest_run} times in a row: {order:?}");
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn staged_prepared_caps_requests_waiting_for_delivery() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |config| {
        config.slots.delivery = 0;
        config.slots.staged_prepared = 2;
    });
    for index in 0..5 {
        harness.submit(mock_request("job-staged", &format!("mock://source/{index}")));
    }

    let scheduler = harness.scheduler.clone();
    let capped = wait_until(SETTLE, || {
        let scheduler = scheduler.clone();
        async move {
            scheduler.snapshot().await.is_ok_and(|snapshot| {
                snapshot.stage(Stage::Delivery).map(|s| s.queued) == Some(2)
                    && snapshot.stage(Stage::PreProcessing).map(|s| s.queued) == Some(3)
                    && snapshot.active == 0
            })
        }
    })
    .await;
    assert!(capped, "pre-processing should pause at the staged cap");

    harness.scheduler.set_slots(20, 5, 0, 2).expect("set slots");
    let finished = harness.recorder.wait_for(5, SETTLE).await;
    assert_eq!(finished.len(), 5);
    assert!(finished.iter().all(|f| f.state == RequestState::Done));
    let limits = harness
        .events
        .backlog_since(0)
        .into_iter()
        .find_map(|envelope| match envelope.event {
            Event::SlotsReconfigured {
                post_processor,
                delivery,
                ..
            } => Some((post_processor, delivery)),
            _ => None,
        });
    assert_eq!(limits, Some((20, 5)));
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn cancelling_a_job_reaches_queued_and_running_requests() {
    let mover = Arc::new(ScriptedMover::with_hold(Duration::from_secs(30)));
    let harness = Harness::start(&mover, |config| config.slots.delivery = 1);
    for index in 0..3 {
        harness.submit(mock_request("job-cancel", &format!("mock://source/{index}")));
    }
    harness.submit(mock_request("job-other", "mock://source/other"));

    let mover_view = Arc::clone(&mover);
    assert!(wait_until(SETTLE, || {
        let mover = Arc::clone(&mover_view);
        async move { mover.max_concurrent() == 1 }
    })
    .await);

    harness.scheduler.cancel_job("job-cancel").expect("cancel");
    let finished = harness.recorder.wait_for(3, SETTLE).await;
    let cancelled: Vec<_> = finished
        .iter()
        .filter(|f| f.job_id == "job-cancel")
        .collect();
    assert_eq!(cancelled.len(), 3);
    assert!(cancelled.iter().all(|f| f.state == RequestState::Cancelled));
    assert!(finished.iter().all(|f| f.job_id != "job-other"));

    harness.scheduler.stop(true).await.expect("stop");
    let finished = harness.recorder.finished();
    assert_eq!(finished.len(), 4);
    assert!(finished.iter().all(|f| f.state == RequestState::Cancelled));
}

#[tokio::test]
async fn cancelling_one_request_leaves_its_job_running() {
    let mover = Arc::new(ScriptedMover::with_hold(Duration::from_millis(50)));
    let harness = Harness::start(&mover, |config| config.slots.delivery = 0);
    let doomed = mock_request("job-single", "mock://source/doomed");
    let doomed_id = doomed.id().clone();
    harness.submit(doomed);
    harness.submit(mock_request("job-single", "mock://source/kept"));

    harness.scheduler.cancel_request(&doomed_id).expect("cancel");
    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished[0].id, doomed_id);
    assert_eq!(finished[0].state, RequestState::Cancelled);

    harness.scheduler.set_slots(20, 1, 0, 200).expect("set slots");
    let finished = harness.recorder.wait_for(2, SETTLE).await;
    assert_eq!(finished[1].source, "mock://source/kept");
    assert_eq!(finished[1].state, RequestState::Done);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn draining_stop_finishes_work_and_refuses_new_requests() {
    let mover = Arc::new(ScriptedMover::with_hold(Duration::from_millis(30)));
    let harness = Harness::start(&mover, |config| config.slots.delivery = 1);
    for index in 0..3 {
        harness.submit(mock_request("job-drain", &format!("mock://source/{index}")));
    }

    harness.scheduler.stop(false).await.expect("stop");
    let finished = harness.recorder.finished();
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|f| f.state == RequestState::Done));

    assert!(!harness.scheduler.is_running());
    let err = harness
        .scheduler
        .submit(mock_request("job-drain", "mock://source/late"))
        .expect_err("stopped scheduler refuses work");
    assert!(matches!(err, SchedulerError::Stopped { .. }));
    harness.scheduler.stop(false).await.expect("second stop is a no-op");
    assert!(harness.events.backlog_since(0).iter().any(|envelope| matches!(
        envelope.event,
        Event::SchedulerStopped {
            cancelled_in_flight: false
        }
    )));
}

#[tokio::test]
async fn resubmitting_a_request_is_rejected() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |_| {});
    let mut request = mock_request("job-twice", "mock://source/once");
    request.submit().expect("local submit");
    let err = harness
        .scheduler
        .submit(request)
        .expect_err("already submitted");
    assert!(matches!(err, SchedulerError::Rejected { .. }));
    harness.scheduler.stop(false).await.expect("stop");
}

struct PanickingCallback;

impl CompletionCallback for PanickingCallback {
    fn on_finished(&self, request: &TransferRequest) {
        panic!("bookkeeping failed for {}", request.source());
    }
}

#[tokio::test]
async fn a_panicking_completion_callback_leaves_the_loop_running() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |_| {});
    harness.submit(
        mock_request("job-callback", "mock://source/a").with_callback(Arc::new(PanickingCallback)),
    );
    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, RequestState::Done);

    harness.submit(mock_request("job-callback", "mock://source/b"));
    let finished = harness.recorder.wait_for(2, SETTLE).await;
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[1].source, "mock://source/b");
    assert_eq!(finished[1].state, RequestState::Done);
    assert!(harness.scheduler.is_running());
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn slow_deliveries_break_the_default_average_speed_window() {
    let mover = Arc::new(ScriptedMover::new());
    let source = "mock://source/slow";
    mover.script(
        source,
        [Step::Trickle {
            bytes: 1,
            every: Duration::from_millis(10),
        }],
    );
    let harness = Harness::start(&mover, |config| {
        config.transfer = TransferParameters {
            min_average_speed: 10_000,
            ..TransferParameters::default()
        };
        assert!(config.transfer.averaging_time.is_zero());
    });
    harness.submit(mock_request("job-slow", source).with_retries(0));

    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, RequestState::Failed);
    let error = finished[0].error.as_ref().expect("failure recorded");
    assert!(error.message().contains("average speed"), "{}", error.message());
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn replaced_shares_apply_from_the_next_stage_transition() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |config| config.slots.delivery = 0);
    let request = mock_request("job-shares", "mock://source/vo").with_vo("atlas");
    let request_id = request.id().to_string();
    harness.submit(request);

    let scheduler = harness.scheduler.clone();
    assert!(wait_until(SETTLE, || {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .snapshot()
                .await
                .is_ok_and(|snapshot| snapshot.stage(Stage::Delivery).map(|s| s.queued) == Some(1))
        }
    })
    .await);

    let by_vo = ShareConfiguration::new(ShareType::Vo, 50).expect("valid shares");
    harness.scheduler.set_transfer_shares_conf(by_vo).expect("set shares");
    harness.scheduler.set_slots(20, 1, 0, 200).expect("set slots");
    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished[0].state, RequestState::Done);

    let shares: Vec<(RequestState, String)> = harness
        .events
        .backlog_since(0)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            Event::StageChanged {
                request_id: id,
                state,
                share,
                ..
            } if id == request_id => Some((state, share)),
            _ => None,
        })
        .collect();
    assert_eq!(
        shares,
        vec![
            (RequestState::PreProcessing, "tester".to_string()),
            (RequestState::Delivering, "tester".to_string()),
            (RequestState::PostProcessing, "atlas".to_string()),
        ]
    );
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn mapped_sources_are_read_from_their_replacement() {
    let mover = Arc::new(ScriptedMover::new());
    let harness = Harness::start(&mover, |config| {
        config.url_map = UrlMap::new()
            .with("mock://se/", "mock://replica/", None)
            .expect("valid mapping");
    });
    harness.submit(mock_request("job-mapped", "mock://se/data/f1"));

    let finished = harness.recorder.wait_for(1, SETTLE).await;
    assert_eq!(finished[0].state, RequestState::Done);
    assert_eq!(mover.start_order(), vec!["mock://replica/data/f1".to_string()]);
    assert_eq!(mover.attempts("mock://se/data/f1"), 0);
    harness.scheduler.stop(false).await.expect("stop");
}

#[tokio::test]
async fn state_dump_lists_requests_waiting_for_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queue.dump");
    let mover = Arc::new(ScriptedMover::new());
    let dump = path.clone();
    let harness = Harness::start(&mover, move |config| {
        config.slots.delivery = 0;
        config.dump_location = Some(dump);
        config.dump_interval = Duration::from_millis(20);
    });
    let request = mock_request("job-dump", "mock://source/dumped");
    let expected = format!("{} delivering 50 tester", request.id());
    harness.submit(request);

    let listed = wait_until(SETTLE, || {
        let path = path.clone();
        let expected = expected.clone();
        async move {
            tokio::fs::read_to_string(&path)
                .await
                .is_ok_and(|text| text.lines().any(|line| line == expected))
        }
    })
    .await;
    assert!(listed, "dump never listed {expected}");

    harness.scheduler.set_dump_location(None).expect("stop dumping");
    harness.scheduler.stop(true).await.expect("stop");
}
