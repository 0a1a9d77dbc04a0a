//! Consumer state machine and receive loop against mock stream clients

use std::sync::Arc;
use std::time::Duration;
use symbion_devkit::{
    job_message, wait_until, JobMessageBuilder, MockStreamClient, MockStreamController,
    RecordingSink, StreamCall, TestHarness, TEST_TOPIC,
};
use symbion_throttle::consumer::{ConsumerHandle, ConsumerStatus, MessageSink, StreamClient};
use symbion_throttle::error::{ConsumerError, StreamError};
use symbion_throttle::policy::ThrottleDecision;
use symbion_throttle::pool::ConsumerPool;

const WAIT: Duration = Duration::from_secs(2);

async fn single_consumer() -> (ConsumerHandle, MockStreamController, Arc<RecordingSink>) {
    let (client, controller) = MockStreamClient::new();
    let sink = Arc::new(RecordingSink::new());
    let handle = ConsumerHandle::spawn(
        1,
        Box::new(client),
        TEST_TOPIC,
        Arc::clone(&sink) as Arc<dyn MessageSink>,
        TestHarness::fast_settings(),
    )
    .await
    .unwrap();
    (handle, controller, sink)
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let (handle, controller, _sink) = single_consumer().await;
    assert_eq!(handle.status(), ConsumerStatus::Active);

    assert_eq!(handle.pause(), Ok(true));
    assert_eq!(handle.pause(), Ok(false));
    assert_eq!(handle.status(), ConsumerStatus::Paused);
    assert!(wait_until(WAIT, || controller.pause_count() == 1).await);

    assert_eq!(handle.resume(), Ok(true));
    assert_eq!(handle.resume(), Ok(false));
    assert_eq!(handle.status(), ConsumerStatus::Active);
    assert!(wait_until(WAIT, || controller.resume_count() == 1).await);

    assert_eq!(handle.set_poll_interval(Duration::from_millis(500)), Ok(true));
    assert_eq!(handle.set_poll_interval(Duration::from_millis(500)), Ok(false));
    assert_eq!(handle.status(), ConsumerStatus::Active);

    handle.stop();
    assert!(handle.join().await.is_ok());
    assert_eq!(controller.pause_count(), 1);
}

#[tokio::test]
async fn test_apply_maps_decisions() {
    let (handle, _controller, _sink) = single_consumer().await;
    let base = TestHarness::fast_settings().base_poll_interval;
    let throttled = Duration::from_millis(300);

    assert_eq!(handle.apply(&ThrottleDecision::Resume), Ok(false));
    assert_eq!(handle.apply(&ThrottleDecision::Throttle(throttled)), Ok(true));
    assert_eq!(handle.state().poll_interval, throttled);

    assert_eq!(handle.apply(&ThrottleDecision::Pause), Ok(true));
    let state = handle.state();
    assert_eq!(state.status, ConsumerStatus::Paused);
    assert_eq!(state.poll_interval, throttled);

    assert_eq!(handle.apply(&ThrottleDecision::Resume), Ok(true));
    let state = handle.state();
    assert_eq!(state.status, ConsumerStatus::Active);
    assert_eq!(state.poll_interval, base);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_terminal() {
    let (handle, controller, _sink) = single_consumer().await;

    assert!(handle.stop());
    assert!(!handle.stop());
    assert_eq!(handle.pause(), Err(ConsumerError::Stopped { id: 1 }));
    assert_eq!(handle.resume(), Err(ConsumerError::Stopped { id: 1 }));
    assert_eq!(
        handle.set_poll_interval(Duration::from_secs(1)),
        Err(ConsumerError::Stopped { id: 1 })
    );
    assert_eq!(
        handle.apply(&ThrottleDecision::Resume),
        Err(ConsumerError::Stopped { id: 1 })
    );
    assert_eq!(handle.status(), ConsumerStatus::Stopped);

    assert!(wait_until(Duration::from_millis(500), || handle.is_finished()).await);
    assert!(handle.join().await.is_ok());
    assert!(handle.join().await.is_ok());
    assert!(controller.is_closed());
    assert_eq!(controller.calls().last(), Some(&StreamCall::Close));
}

#[tokio::test]
async fn test_stop_interrupts_paused_and_throttled_waits() {
    let (handle, controller, _sink) = single_consumer().await;
    handle.pause().unwrap();
    assert!(wait_until(WAIT, || controller.is_paused()).await);
    handle.stop();
    assert!(wait_until(Duration::from_millis(500), || handle.is_finished()).await);

    let (handle, controller, _sink) = single_consumer().await;
    let long = Duration::from_secs(30);
    handle.set_poll_interval(long).unwrap();
    assert!(wait_until(WAIT, || controller.last_receive_timeout() == Some(long)).await);
    handle.stop();
    assert!(wait_until(Duration::from_millis(500), || handle.is_finished()).await);
}

#[tokio::test]
async fn test_paused_consumer_does_not_receive() {
    let (handle, controller, sink) = single_consumer().await;

    handle.pause().unwrap();
    assert!(wait_until(WAIT, || controller.pause_count() == 1).await);
    let receives = controller.receive_count();

    controller.push_messages(JobMessageBuilder::batch("jobs", "held", 3));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(controller.receive_count(), receives);
    assert_eq!(sink.count(), 0);
    assert_eq!(controller.pending(), 3);

    handle.resume().unwrap();
    assert!(sink.wait_for(3, WAIT).await);
    assert_eq!(controller.resume_count(), 1);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_active_consumer_polls_with_base_interval() {
    let (handle, controller, sink) = single_consumer().await;
    let base = TestHarness::fast_settings().base_poll_interval;

    assert!(wait_until(WAIT, || controller.receive_count() >= 2).await);
    assert_eq!(controller.last_receive_timeout(), Some(base));

    controller.push_message(job_message("jobs", "job-1"));
    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(sink.deliveries()[0].consumer_id, 1);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_throttled_consumer_is_paced() {
    let (handle, controller, sink) = single_consumer().await;
    let interval = Duration::from_millis(150);
    handle.apply(&ThrottleDecision::Throttle(interval)).unwrap();

    controller.push_messages(JobMessageBuilder::batch("jobs", "paced", 3));
    assert!(sink.wait_for(3, WAIT).await);

    let times = sink.times_for(1);
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(120),
            "deliveries {:?} apart",
            pair[1] - pair[0]
        );
    }

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_transient_error_keeps_consumer_alive() {
    let (handle, controller, sink) = single_consumer().await;

    controller.push_error(StreamError::Transient("broker hiccup".to_string()));
    controller.push_message(job_message("jobs", "after-error"));

    assert!(sink.wait_for(1, WAIT).await);
    let state = handle.state();
    assert_eq!(state.status, ConsumerStatus::Active);
    assert_eq!(
        state.last_error,
        Some(StreamError::Transient("broker hiccup".to_string()))
    );

    handle.stop();
    assert!(handle.join().await.is_ok());
}

#[tokio::test]
async fn test_fatal_error_stops_only_that_consumer() {
    let harness = TestHarness::start(3).await.unwrap();
    let fatal = StreamError::Fatal("not authorized".to_string());

    harness.controller(2).push_error(fatal.clone());
    assert!(harness.wait_for_status(2, ConsumerStatus::Stopped, WAIT).await);
    assert!(wait_until(WAIT, || harness.controller(2).is_closed()).await);

    let summary = harness.pool.apply(&ThrottleDecision::Pause);
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.stopped, 1);
    assert_eq!(harness.pool.get(1).unwrap().status(), ConsumerStatus::Paused);
    assert_eq!(harness.pool.get(3).unwrap().status(), ConsumerStatus::Paused);
    assert_eq!(harness.pool.get(2).unwrap().state().last_error, Some(fatal.clone()));

    let report = harness.pool.shutdown().await;
    assert_eq!(report.consumers, 3);
    assert_eq!(
        report.failures,
        vec![ConsumerError::Fatal { id: 2, source: fatal }]
    );
}

#[tokio::test]
async fn test_failed_subscribe_closes_client() {
    let (client, controller) =
        MockStreamClient::failing_subscribe(StreamError::Fatal("no such topic".to_string()));
    let result = ConsumerHandle::spawn(
        7,
        Box::new(client),
        TEST_TOPIC,
        Arc::new(RecordingSink::new()),
        TestHarness::fast_settings(),
    )
    .await;

    assert!(matches!(result, Err(ConsumerError::Subscribe { id: 7, .. })));
    assert!(controller.is_closed());
}

#[tokio::test]
async fn test_pool_spawn_failure_stops_started_consumers() {
    let mut controllers = Vec::new();
    let result = ConsumerPool::spawn(
        3,
        TEST_TOPIC,
        Arc::new(RecordingSink::new()),
        TestHarness::fast_settings(),
        |id| {
            let (client, controller) = if id == 2 {
                MockStreamClient::failing_subscribe(StreamError::Fatal("refused".to_string()))
            } else {
                MockStreamClient::new()
            };
            controllers.push(controller);
            Box::new(client) as Box<dyn StreamClient>
        },
    )
    .await;

    assert!(matches!(result, Err(ConsumerError::Subscribe { id: 2, .. })));
    // Consumer 3 is never created
    assert_eq!(controllers.len(), 2);
    assert!(controllers.iter().all(MockStreamController::is_closed));
}

#[tokio::test]
async fn test_dropped_handle_stops_its_loop() {
    let (handle, controller, _sink) = single_consumer().await;
    drop(handle);
    assert!(wait_until(WAIT, || controller.is_closed()).await);
}
