//! End-to-end pipeline tests against the in-memory gateway.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use testpulse_core::{
    CheckpointRegistry, DbLogConfig, EventProcessor, ProcessingError, RegistryError,
    TelemetryChannel,
};
use testpulse_store::{MemoryGateway, PersistenceGateway};
use testpulse_types::{
    CheckpointDetail, CheckpointResult, EventRequest, LoadQueueResult, MessageLevel, RunPatch,
    TelemetryEvent, TestcaseResult, TestcaseState,
};

fn start_run_event(name: &str) -> TelemetryEvent {
    TelemetryEvent::StartRun {
        name: name.into(),
        os: "linux".into(),
        product: "gateway".into(),
        version: "2.1".into(),
        build: "1042".into(),
        host: "exec-01".into(),
    }
}

fn message(text: &str) -> TelemetryEvent {
    TelemetryEvent::InsertMessage {
        text: text.into(),
        level: MessageLevel::Info,
        escape_html: false,
        is_run_message: false,
    }
}

fn processor(config: DbLogConfig, gw: &MemoryGateway) -> EventProcessor {
    EventProcessor::new(
        config,
        Arc::new(gw.clone()),
        Arc::new(CheckpointRegistry::new()),
        None,
        Arc::new(AtomicI64::new(0)),
    )
}

async fn feed(processor: &mut EventProcessor, event: TelemetryEvent) {
    processor
        .process(Some(EventRequest::new(event, "main")))
        .await
        .unwrap();
}

async fn open_testcase(processor: &mut EventProcessor) -> i64 {
    feed(processor, start_run_event("nightly")).await;
    feed(
        processor,
        TelemetryEvent::StartSuite {
            name: "auth".into(),
            package: "com.example.auth".into(),
        },
    )
    .await;
    feed(
        processor,
        TelemetryEvent::StartTestcase {
            suite_name: "auth".into(),
            scenario_name: "login".into(),
            scenario_description: "".into(),
            name: "login_ok".into(),
        },
    )
    .await;
    processor.state().testcase_id()
}

#[tokio::test]
async fn full_session_reaches_the_store() {
    let gw = MemoryGateway::new();
    let (channel, handle) = TelemetryChannel::spawn(
        DbLogConfig {
            machine: "exec-01".into(),
            ..DbLogConfig::default()
        },
        Arc::new(gw.clone()),
        None,
    );

    channel.log(start_run_event("nightly"), "main").await.unwrap();
    channel
        .log(
            TelemetryEvent::AddRunMetainfo {
                key: "branch".into(),
                value: "main".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel
        .log(
            TelemetryEvent::StartSuite {
                name: "auth".into(),
                package: "com.example.auth".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel
        .log(
            TelemetryEvent::StartTestcase {
                suite_name: "auth".into(),
                scenario_name: "login".into(),
                scenario_description: "happy path".into(),
                name: "login_ok".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel.log(message("checking credentials"), "main").await.unwrap();
    channel
        .log(
            TelemetryEvent::EndTestcase {
                result: TestcaseResult::Passed,
            },
            "main",
        )
        .await
        .unwrap();
    channel.log(TelemetryEvent::EndSuite, "main").await.unwrap();
    channel.log(TelemetryEvent::EndRun, "main").await.unwrap();

    channel.shutdown().await.unwrap();
    handle.await.unwrap();

    assert!(channel.take_critical_error().is_none());
    assert_eq!(gw.counts().sanity_checks, 1);
    let run = gw.run(1).expect("run row");
    assert_eq!(run.name, "nightly");
    assert!(run.ended_at.is_some());
    assert_eq!(gw.run_metainfo(1), vec![("branch".into(), "main".into())]);

    let testcase_id = gw
        .testcase(3)
        .map(|tc| {
            assert_eq!(tc.result, TestcaseResult::Passed);
            assert!(tc.ended_at.is_some());
            tc.id
        })
        .expect("testcase row");
    assert_eq!(
        gw.testcase_message_texts(testcase_id),
        vec!["checking credentials".to_string()]
    );
}

#[tokio::test]
async fn out_of_order_critical_event_is_surfaced() {
    let gw = MemoryGateway::new();
    let (channel, handle) =
        TelemetryChannel::spawn(DbLogConfig::default(), Arc::new(gw.clone()), None);

    // No suite is open, so this must fail and be kept for the caller.
    channel
        .log(
            TelemetryEvent::StartTestcase {
                suite_name: "auth".into(),
                scenario_name: "".into(),
                scenario_description: "".into(),
                name: "orphan".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel.shutdown().await.unwrap();
    handle.await.unwrap();

    match channel.take_critical_error() {
        Some(ProcessingError::PhaseViolation { .. }) => {}
        other => panic!("expected a phase violation, got {other:?}"),
    }
    // The slot is cleared on read.
    assert!(channel.take_critical_error().is_none());
}

#[tokio::test]
async fn externally_deleted_testcase_degrades_to_noops() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    let testcase_id = open_testcase(&mut processor).await;

    gw.remove_testcase(testcase_id);

    // First write detects the deletion and is swallowed; later ones are
    // suppressed without touching the store.
    feed(&mut processor, message("after deletion")).await;
    feed(&mut processor, message("still suppressed")).await;
    assert_eq!(gw.counts().testcase_messages, 0);

    // Ending the deleted testcase is a no-op, and the session recovers.
    feed(
        &mut processor,
        TelemetryEvent::EndTestcase {
            result: TestcaseResult::Failed,
        },
    )
    .await;
    feed(
        &mut processor,
        TelemetryEvent::StartTestcase {
            suite_name: "auth".into(),
            scenario_name: "".into(),
            scenario_description: "".into(),
            name: "next_case".into(),
        },
    )
    .await;
    feed(&mut processor, message("fresh testcase")).await;
    assert_eq!(gw.counts().testcase_messages, 1);
}

#[tokio::test]
async fn requested_deletion_is_promoted_before_next_event() {
    let gw = MemoryGateway::new();
    let (channel, handle) =
        TelemetryChannel::spawn(DbLogConfig::default(), Arc::new(gw.clone()), None);

    channel.log(start_run_event("nightly"), "main").await.unwrap();
    channel
        .log(
            TelemetryEvent::StartSuite {
                name: "auth".into(),
                package: "".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel
        .log(
            TelemetryEvent::StartTestcase {
                suite_name: "auth".into(),
                scenario_name: "".into(),
                scenario_description: "".into(),
                name: "doomed".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel.shutdown().await.unwrap();

    // The id is known once the consumer drained the queue.
    handle.await.unwrap();
    let doomed = 3;
    assert!(gw.testcase(doomed).is_some());

    let (channel2, handle2) =
        TelemetryChannel::spawn(DbLogConfig::default(), Arc::new(gw.clone()), None);
    channel2.request_testcase_deletion(doomed);
    channel2.log(message("any event"), "main").await.unwrap();
    channel2.shutdown().await.unwrap();
    handle2.await.unwrap();

    assert!(gw.testcase(doomed).is_none(), "deletion must be promoted");
}

#[tokio::test]
async fn update_run_before_start_is_parked_and_merged() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);

    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::UpdateRun(RunPatch {
                user_note: Some("rerun after infra fix".into()),
                ..RunPatch::default()
            }),
            "main",
        )))
        .await
        .unwrap();

    feed(&mut processor, start_run_event("nightly")).await;
    let run = gw.run(processor.state().run_id()).unwrap();
    assert_eq!(run.user_note, "rerun after infra fix");
    // Backfilled fields keep their started values.
    assert_eq!(run.name, "nightly");
    assert_eq!(run.build, "1042");
}

#[tokio::test]
async fn repeated_suite_name_reuses_the_row() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    feed(&mut processor, start_run_event("nightly")).await;

    feed(
        &mut processor,
        TelemetryEvent::StartSuite {
            name: "auth".into(),
            package: "".into(),
        },
    )
    .await;
    let first_suite = processor.state().suite_id();
    feed(&mut processor, TelemetryEvent::EndSuite).await;
    feed(
        &mut processor,
        TelemetryEvent::StartSuite {
            name: "auth".into(),
            package: "".into(),
        },
    )
    .await;
    assert_eq!(processor.state().suite_id(), first_suite);

    feed(
        &mut processor,
        TelemetryEvent::StartTestcase {
            suite_name: "auth".into(),
            scenario_name: "".into(),
            scenario_description: "".into(),
            name: "tc".into(),
        },
    )
    .await;
    assert_eq!(gw.testcase(processor.state().testcase_id()).unwrap().suite_id, first_suite);
}

#[tokio::test]
async fn load_queue_checkpoint_roundtrip() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            checkpoint_detail: CheckpointDetail::Full,
            ..DbLogConfig::default()
        },
        &gw,
    );
    let testcase_id = open_testcase(&mut processor).await;

    let queue_id = gw
        .start_load_queue(
            &testpulse_store::NewLoadQueue {
                testcase_id,
                name: "ramp-up".into(),
                thread_count: 2,
                threading_pattern: "all-at-once".into(),
                host: "agent-01".into(),
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    feed(
        &mut processor,
        TelemetryEvent::RememberLoadQueue {
            name: "ramp-up".into(),
            load_queue_id: queue_id,
        },
    )
    .await;
    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::RegisterThreadWithLoadQueue {
                load_queue_name: "ramp-up".into(),
            },
            "worker-1",
        )))
        .await
        .unwrap();

    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::StartCheckpoint {
                name: "login".into(),
                transfer_unit: "KB".into(),
            },
            "worker-1",
        )))
        .await
        .unwrap();

    // A second open checkpoint with the same name on the same thread is
    // a pairing violation.
    let err = processor
        .process(Some(EventRequest::new(
            TelemetryEvent::StartCheckpoint {
                name: "login".into(),
                transfer_unit: "KB".into(),
            },
            "worker-1",
        )))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessingError::Registry(RegistryError::CheckpointAlreadyStarted { .. })
    ));

    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::EndCheckpoint {
                name: "login".into(),
                transfer_size: 2048,
                result: CheckpointResult::Passed,
            },
            "worker-1",
        )))
        .await
        .unwrap();

    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::InsertCheckpoint {
                name: "login".into(),
                response_time_ms: 12,
                transfer_size: 24,
                transfer_unit: "KB".into(),
                result: CheckpointResult::Passed,
            },
            "worker-1",
        )))
        .await
        .unwrap();

    feed(
        &mut processor,
        TelemetryEvent::EndLoadQueue {
            name: "ramp-up".into(),
            result: LoadQueueResult::Passed,
        },
    )
    .await;

    let summary = gw.summary(queue_id, "login").expect("summary row");
    assert_eq!(summary.num_passed, 2);
    assert_eq!(gw.checkpoint_row_count(), 2);
    assert!(!processor.registry().is_load_queue_running("ramp-up"));
}

#[tokio::test]
async fn disabled_checkpoints_are_noops() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            enable_checkpoints: false,
            ..DbLogConfig::default()
        },
        &gw,
    );
    open_testcase(&mut processor).await;

    processor
        .process(Some(EventRequest::new(
            TelemetryEvent::InsertCheckpoint {
                name: "login".into(),
                response_time_ms: 5,
                transfer_size: 0,
                transfer_unit: String::new(),
                result: CheckpointResult::Passed,
            },
            "worker-1",
        )))
        .await
        .unwrap();
    assert_eq!(gw.checkpoint_row_count(), 0);
}

#[tokio::test]
async fn batch_mode_flushes_at_chunk_size_only() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            batch_mode: true,
            chunk_size: 3,
            max_cache_age_secs: 3600,
            ..DbLogConfig::default()
        },
        &gw,
    );
    open_testcase(&mut processor).await;

    feed(&mut processor, message("1")).await;
    feed(&mut processor, message("2")).await;
    assert_eq!(gw.counts().testcase_messages, 0, "below chunk size");

    feed(&mut processor, message("3")).await;
    assert_eq!(gw.counts().testcase_messages, 3);
    assert_eq!(gw.counts().batches_flushed, 1);
}

#[tokio::test]
async fn idle_tick_flushes_pending_rows() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            batch_mode: true,
            chunk_size: 1000,
            max_cache_age_secs: 3600,
            ..DbLogConfig::default()
        },
        &gw,
    );
    open_testcase(&mut processor).await;
    feed(&mut processor, message("waiting")).await;
    assert_eq!(gw.counts().testcase_messages, 0);

    processor.process(None).await.unwrap();
    assert_eq!(gw.counts().testcase_messages, 1);
}

#[tokio::test]
async fn failed_batch_is_dropped_not_retried() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            batch_mode: true,
            chunk_size: 1000,
            max_cache_age_secs: 3600,
            ..DbLogConfig::default()
        },
        &gw,
    );
    open_testcase(&mut processor).await;
    feed(&mut processor, message("doomed 1")).await;
    feed(&mut processor, message("doomed 2")).await;

    gw.fail_next_flush();
    assert!(processor.process(None).await.is_err());
    assert_eq!(gw.counts().testcase_messages, 0);

    feed(&mut processor, message("survivor")).await;
    processor.process(None).await.unwrap();
    let testcase_id = processor.state().testcase_id();
    assert_eq!(
        gw.testcase_message_texts(testcase_id),
        vec!["survivor".to_string()]
    );
}

#[tokio::test]
async fn end_testcase_flushes_cached_rows_first() {
    let gw = MemoryGateway::new();
    let mut processor = processor(
        DbLogConfig {
            batch_mode: true,
            chunk_size: 1000,
            max_cache_age_secs: 3600,
            ..DbLogConfig::default()
        },
        &gw,
    );
    let testcase_id = open_testcase(&mut processor).await;
    feed(&mut processor, message("late arrival")).await;

    feed(
        &mut processor,
        TelemetryEvent::EndTestcase {
            result: TestcaseResult::Passed,
        },
    )
    .await;
    assert_eq!(
        gw.testcase_message_texts(testcase_id),
        vec!["late arrival".to_string()]
    );
    assert_eq!(gw.testcase(testcase_id).unwrap().result, TestcaseResult::Passed);
}

#[tokio::test]
async fn shutdown_flushes_pending_batch() {
    let gw = MemoryGateway::new();
    let (channel, handle) = TelemetryChannel::spawn(
        DbLogConfig {
            batch_mode: true,
            chunk_size: 1000,
            max_cache_age_secs: 3600,
            poll_interval_secs: 3600,
            ..DbLogConfig::default()
        },
        Arc::new(gw.clone()),
        None,
    );

    channel.log(start_run_event("nightly"), "main").await.unwrap();
    channel
        .log(
            TelemetryEvent::StartSuite {
                name: "auth".into(),
                package: "".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel
        .log(
            TelemetryEvent::StartTestcase {
                suite_name: "auth".into(),
                scenario_name: "".into(),
                scenario_description: "".into(),
                name: "tc".into(),
            },
            "main",
        )
        .await
        .unwrap();
    channel.log(message("pending row"), "main").await.unwrap();
    channel.shutdown().await.unwrap();
    handle.await.unwrap();

    assert_eq!(gw.counts().testcase_messages, 1);
}

#[tokio::test]
async fn statistics_land_on_the_open_testcase() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    open_testcase(&mut processor).await;

    let def_id = gw
        .register_statistic_definition(&testpulse_types::StatisticDefinition {
            name: "cpu".into(),
            parent_name: "".into(),
            internal_name: "cpu_total".into(),
            unit: "%".into(),
            params: "".into(),
        })
        .await
        .unwrap();

    feed(
        &mut processor,
        TelemetryEvent::InsertSystemStatistic(testpulse_types::StatisticSample {
            machine: "agent-01".into(),
            definition_ids: vec![def_id],
            values: vec![42.5],
            timestamp: chrono::Utc::now(),
        }),
    )
    .await;
    assert_eq!(gw.statistic_count(), 1);
}

#[tokio::test]
async fn join_and_leave_testcase() {
    let gw = MemoryGateway::new();

    // Another process created the hierarchy.
    let now = chrono::Utc::now();
    let run_id = gw
        .start_run(
            &testpulse_store::NewRun {
                name: "remote".into(),
                os: String::new(),
                product: String::new(),
                version: String::new(),
                build: String::new(),
                host: String::new(),
            },
            now,
        )
        .await
        .unwrap();
    let suite_id = gw.start_suite(run_id, "s", "", now).await.unwrap();
    let testcase_id = gw.start_testcase(suite_id, "", "", "tc", now).await.unwrap();

    let mut processor = processor(DbLogConfig::default(), &gw);
    feed(
        &mut processor,
        TelemetryEvent::JoinTestcase(TestcaseState {
            run_id,
            testcase_id,
            last_executed_testcase_id: None,
        }),
    )
    .await;
    feed(&mut processor, message("from the agent")).await;
    assert_eq!(
        gw.testcase_message_texts(testcase_id),
        vec!["from the agent".to_string()]
    );

    feed(&mut processor, TelemetryEvent::LeaveTestcase).await;
    assert_eq!(
        processor.state().phase(),
        testpulse_core::LifecyclePhase::Initialized
    );
}

#[tokio::test]
async fn after_method_messages_target_last_executed_testcase() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    let testcase_id = open_testcase(&mut processor).await;
    feed(
        &mut processor,
        TelemetryEvent::EndTestcase {
            result: TestcaseResult::Passed,
        },
    )
    .await;

    feed(&mut processor, TelemetryEvent::StartAfterMethod).await;
    feed(&mut processor, message("teardown detail")).await;
    feed(
        &mut processor,
        TelemetryEvent::AddTestcaseMetainfo {
            testcase_id: None,
            key: "teardown".into(),
            value: "done".into(),
        },
    )
    .await;
    feed(&mut processor, TelemetryEvent::EndAfterMethod).await;

    assert_eq!(
        gw.testcase_message_texts(testcase_id),
        vec!["teardown detail".to_string()]
    );
    assert_eq!(
        gw.testcase_metainfo(testcase_id),
        vec![("teardown".into(), "done".into())]
    );
}

#[tokio::test]
async fn after_method_overlay_beats_the_open_testcase() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    let first = open_testcase(&mut processor).await;
    feed(
        &mut processor,
        TelemetryEvent::EndTestcase {
            result: TestcaseResult::Passed,
        },
    )
    .await;

    // Teardown of the first case runs while the second is already open.
    feed(&mut processor, TelemetryEvent::StartAfterMethod).await;
    feed(
        &mut processor,
        TelemetryEvent::StartTestcase {
            suite_name: "auth".into(),
            scenario_name: "".into(),
            scenario_description: "".into(),
            name: "next_case".into(),
        },
    )
    .await;
    let second = processor.state().testcase_id();
    feed(&mut processor, message("first case teardown")).await;

    assert_eq!(
        gw.testcase_message_texts(first),
        vec!["first case teardown".to_string()]
    );
    assert!(gw.testcase_message_texts(second).is_empty());

    feed(&mut processor, TelemetryEvent::EndAfterMethod).await;
    feed(&mut processor, message("second case body")).await;
    assert_eq!(
        gw.testcase_message_texts(second),
        vec!["second case body".to_string()]
    );
}

#[tokio::test]
async fn after_class_messages_target_last_ended_suite() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    feed(&mut processor, start_run_event("nightly")).await;
    feed(
        &mut processor,
        TelemetryEvent::StartSuite {
            name: "one".into(),
            package: "".into(),
        },
    )
    .await;
    let first = processor.state().suite_id();
    feed(&mut processor, TelemetryEvent::EndSuite).await;

    feed(&mut processor, TelemetryEvent::StartAfterClass).await;
    feed(
        &mut processor,
        TelemetryEvent::StartSuite {
            name: "two".into(),
            package: "".into(),
        },
    )
    .await;
    let second = processor.state().suite_id();
    feed(&mut processor, message("first suite teardown")).await;
    feed(&mut processor, TelemetryEvent::EndAfterClass).await;

    assert_eq!(
        gw.suite_message_texts(first),
        vec!["first suite teardown".to_string()]
    );
    assert!(gw.suite_message_texts(second).is_empty());
}

#[tokio::test]
async fn after_suite_messages_target_the_run() {
    let gw = MemoryGateway::new();
    let mut processor = processor(DbLogConfig::default(), &gw);
    feed(&mut processor, start_run_event("nightly")).await;
    feed(
        &mut processor,
        TelemetryEvent::StartSuite {
            name: "auth".into(),
            package: "".into(),
        },
    )
    .await;
    let suite_id = processor.state().suite_id();
    let run_id = processor.state().run_id();

    feed(&mut processor, TelemetryEvent::StartAfterSuite).await;
    feed(&mut processor, message("suite teardown detail")).await;
    feed(&mut processor, TelemetryEvent::EndAfterSuite).await;

    assert_eq!(
        gw.run_message_texts(run_id),
        vec!["suite teardown detail".to_string()]
    );
    assert!(gw.suite_message_texts(suite_id).is_empty());
}
