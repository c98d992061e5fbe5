//! Integration tests for admission control
//!
//! Concurrency limits, queuing, token bucket throttling and queue
//! cancellation, exercised through a full pipeline.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callgate_common::testing::init_test_tracing;
use callgate_core::{
    AdmissionAttempt, AdmissionController, CallFailure, Pipeline, PipelineConfig, PipelineError,
    RejectReason, RequestClassifier, RequestDescriptor, TokenBucketConfig,
};
use futures::future::join_all;
use support::transports::{GatedTransport, ScriptedTransport};
use support::wait_for;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Call = JoinHandle<Result<u32, CallFailure<u32>>>;

fn spawn_call(
    pipeline: &Arc<Pipeline<u32, u32>>,
    transport: &Arc<GatedTransport>,
    descriptor: RequestDescriptor<u32>,
) -> Call {
    let pipeline = Arc::clone(pipeline);
    let transport = Arc::clone(transport);
    tokio::spawn(async move { pipeline.execute(descriptor, transport.as_ref()).await })
}

/// Validates global concurrency with queuing (5 requests, limit 2).
///
/// # Test Steps
/// 1. Start 5 requests against a transport that blocks until released
/// 2. Verify 2 run immediately and 3 are queued
/// 3. Release calls one by one; each completion admits exactly one more
/// 4. Verify all 5 complete successfully and peak concurrency stayed at 2
#[tokio::test]
async fn test_global_limit_queues_excess_requests() {
    init_test_tracing();
    let config = PipelineConfig {
        global_concurrency: Some(2),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let calls: Vec<Call> = (0..5)
        .map(|i| spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", i)))
        .collect();

    assert!(wait_for(|| transport.started_count() == 2).await);
    assert!(wait_for(|| pipeline.admission().queue_len() == 3).await);
    assert_eq!(pipeline.stats("/a").in_flight, 2);
    assert_eq!(pipeline.stats("/a").queue_depth, 3);

    for expected_started in 3..=5 {
        transport.open(1);
        assert!(wait_for(|| transport.started_count() == expected_started).await);
        assert_eq!(transport.active_total(), 2);
    }
    transport.open(2);

    for call in join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }
    assert_eq!(transport.peak_total(), 2);
    assert_eq!(pipeline.admission().global_in_flight(), 0);
    assert_eq!(pipeline.admission().queue_len(), 0);
}

/// Validates that a per-endpoint limit of 1 serializes calls to that
/// endpoint while other endpoints stay unconstrained.
#[tokio::test]
async fn test_endpoint_limit_serializes_calls() {
    let config = PipelineConfig {
        endpoint_concurrency: HashMap::from([("/a".to_string(), 1)]),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let calls = vec![
        spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 1)),
        spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 2)),
        spawn_call(&pipeline, &transport, RequestDescriptor::new("/b", 3)),
        spawn_call(&pipeline, &transport, RequestDescriptor::new("/b", 4)),
    ];

    assert!(wait_for(|| transport.started_count() == 3).await);
    assert_eq!(pipeline.stats("/a").in_flight, 1);
    assert_eq!(pipeline.stats("/a").queue_depth, 1);
    assert_eq!(pipeline.stats("/b").in_flight, 2);

    transport.open(4);
    for call in join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }
    assert_eq!(transport.peak("/a"), 1);
    assert_eq!(transport.peak("/b"), 2);
}

/// Validates token bucket throttling without a queue.
///
/// # Test Steps
/// 1. Bucket of capacity 2 refilling 1 token per 100ms, queuing disabled
/// 2. Three rapid requests: 2 succeed, the third is rejected
/// 3. After one refill interval a further request succeeds
#[tokio::test(start_paused = true)]
async fn test_token_bucket_rejects_when_empty() {
    let config = PipelineConfig {
        token_bucket: Some(TokenBucketConfig {
            capacity: 2,
            refill_rate: 1,
            interval: Duration::from_millis(100),
        }),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::<u32, u32>::new(config).unwrap();
    let transport = ScriptedTransport::default();

    let mut outcomes = Vec::new();
    for i in 0..3 {
        outcomes.push(pipeline.execute(RequestDescriptor::new("/a", i), &transport).await);
    }

    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    let rejected = outcomes.pop().unwrap().unwrap_err();
    assert!(matches!(
        rejected.error(),
        PipelineError::AdmissionRejected { reason: RejectReason::NoCapacity, .. }
    ));
    assert_eq!(transport.calls(), 2);

    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(pipeline.execute(RequestDescriptor::new("/a", 9), &transport).await.is_ok());
    assert_eq!(transport.calls(), 3);
}

/// Validates that a refill tick drains the queue when tokens were the
/// bottleneck.
#[tokio::test(start_paused = true)]
async fn test_refill_admits_queued_requests() {
    let config = PipelineConfig {
        queue_enabled: true,
        token_bucket: Some(TokenBucketConfig {
            capacity: 1,
            refill_rate: 1,
            interval: Duration::from_millis(100),
        }),
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());
    transport.open(10);

    let calls: Vec<Call> = (0..3)
        .map(|i| spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", i)))
        .collect();

    let start = tokio::time::Instant::now();
    for call in join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(transport.started(), vec![0, 1, 2]);
}

/// Validates queue ordering: priority descending, FIFO within a priority.
#[tokio::test]
async fn test_queue_drains_by_priority_then_fifo() {
    let config = PipelineConfig {
        global_concurrency: Some(1),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let mut calls = vec![spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 0))];
    assert!(wait_for(|| transport.started_count() == 1).await);

    for (payload, priority) in [(1, 1), (2, 5), (3, 5), (4, 3)] {
        let descriptor = RequestDescriptor::new("/a", payload).with_priority(priority);
        calls.push(spawn_call(&pipeline, &transport, descriptor));
        let expected = payload as usize;
        assert!(wait_for(|| pipeline.admission().queue_len() == expected).await);
    }

    transport.open(5);
    for call in join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }
    assert_eq!(transport.started(), vec![0, 2, 3, 4, 1]);
}

#[tokio::test]
async fn test_full_queue_rejects() {
    let config = PipelineConfig {
        global_concurrency: Some(1),
        queue_enabled: true,
        max_queue_depth: Some(1),
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let running = spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 1));
    assert!(wait_for(|| transport.started_count() == 1).await);
    let queued = spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 2));
    assert!(wait_for(|| pipeline.admission().queue_len() == 1).await);

    let rejected =
        pipeline.execute(RequestDescriptor::new("/a", 3), transport.as_ref()).await.unwrap_err();
    assert!(matches!(
        rejected.error(),
        PipelineError::AdmissionRejected { reason: RejectReason::QueueFull, .. }
    ));

    transport.open(2);
    assert!(running.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
}

/// Validates cancellation of a queued request.
///
/// Assertions:
/// - The cancelled request fails with `Cancelled` and leaves the queue.
/// - It never reaches the transport, and the next request still runs.
#[tokio::test]
async fn test_cancelled_request_leaves_queue() {
    let config = PipelineConfig {
        global_concurrency: Some(1),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let running = spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 1));
    assert!(wait_for(|| transport.started_count() == 1).await);

    let token = CancellationToken::new();
    let cancelled = spawn_call(
        &pipeline,
        &transport,
        RequestDescriptor::new("/a", 2).with_cancellation(token.clone()),
    );
    let waiting = spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 3));
    assert!(wait_for(|| pipeline.admission().queue_len() == 2).await);

    token.cancel();
    let failure = cancelled.await.unwrap().unwrap_err();
    assert!(matches!(failure.error(), PipelineError::Cancelled));
    assert_eq!(pipeline.admission().queue_len(), 1);

    transport.open(2);
    assert!(running.await.unwrap().is_ok());
    assert!(waiting.await.unwrap().is_ok());
    assert_eq!(transport.started(), vec![1, 3]);
}

/// Validates that dispose rejects everything still queued.
#[tokio::test]
async fn test_dispose_rejects_queued_requests() {
    let config = PipelineConfig {
        global_concurrency: Some(1),
        queue_enabled: true,
        token_bucket: Some(TokenBucketConfig {
            capacity: 5,
            refill_rate: 1,
            interval: Duration::from_millis(50),
        }),
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());

    let running = spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", 1));
    assert!(wait_for(|| transport.started_count() == 1).await);
    let queued: Vec<Call> = (2..4)
        .map(|i| spawn_call(&pipeline, &transport, RequestDescriptor::new("/a", i)))
        .collect();
    assert!(wait_for(|| pipeline.admission().queue_len() == 2).await);

    pipeline.dispose();

    for call in join_all(queued).await {
        let failure = call.unwrap().unwrap_err();
        assert!(matches!(failure.error(), PipelineError::Disposed));
    }

    // Calls already admitted complete normally.
    transport.open(1);
    assert!(running.await.unwrap().is_ok());

    let bucket = pipeline.admission().token_bucket().unwrap();
    assert!(bucket.is_stopped());
    let tokens = bucket.tokens();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(bucket.tokens(), tokens);
}

/// Validates the concurrency invariants under a multi-threaded runtime.
///
/// # Test Steps
/// 1. Global limit 4, "/a" limited to 1 and "/b" to 2, queuing enabled
/// 2. Fire 60 requests across three endpoints from many tasks
/// 3. Verify every request succeeds and no limit was ever exceeded
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limits_hold_under_contention() {
    let config = PipelineConfig {
        global_concurrency: Some(4),
        endpoint_concurrency: HashMap::from([("/a".to_string(), 1), ("/b".to_string(), 2)]),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(Pipeline::<u32, u32>::new(config).unwrap());
    let transport = Arc::new(GatedTransport::new());
    transport.open(1_000);

    let endpoints = ["/a", "/b", "/c"];
    let calls: Vec<Call> = (0..60)
        .map(|i| {
            let endpoint = endpoints[i as usize % endpoints.len()];
            spawn_call(&pipeline, &transport, RequestDescriptor::new(endpoint, i))
        })
        .collect();

    for call in join_all(calls).await {
        assert!(call.unwrap().is_ok());
    }

    assert!(transport.peak_total() <= 4);
    assert!(transport.peak("/a") <= 1);
    assert!(transport.peak("/b") <= 2);
    assert_eq!(transport.started_count(), 60);
    assert_eq!(pipeline.admission().global_in_flight(), 0);
    for endpoint in endpoints {
        assert_eq!(pipeline.admission().in_flight(endpoint), 0);
    }
}

/// Validates the non-blocking admission API directly.
#[tokio::test]
async fn test_try_acquire_and_withdraw() {
    let config = PipelineConfig {
        global_concurrency: Some(1),
        queue_enabled: true,
        ..PipelineConfig::default()
    };
    let controller = AdmissionController::new(&config, Arc::new(RequestClassifier::new()));
    let first = RequestDescriptor::new("/a", ());
    let second = RequestDescriptor::new("/a", ());

    assert!(matches!(controller.try_acquire(&first), Ok(AdmissionAttempt::Admitted(_))));
    let Ok(AdmissionAttempt::Queued(pending)) = controller.try_acquire(&second) else {
        panic!("second request should queue");
    };
    assert_eq!(controller.queue_len(), 1);

    assert!(controller.withdraw(pending.ticket()));
    assert!(!controller.withdraw(pending.ticket()));
    assert!(matches!(pending.wait().await, Err(PipelineError::Withdrawn)));

    controller.release(&first);
    controller.release(&first);
    assert_eq!(controller.global_in_flight(), 0);
}
