use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use heating_control::config::ControllerConfig;
use heating_control::controller::{Controller, ControllerState, RunHandle};
use heating_control::error::{ConnectionError, RunError, ShutdownError, TransportError};
use heating_control::message::{ActuationCommand, Reading};
use heating_control::mqtt::{CallCounts, LoopbackBroker};
use tokio::sync::mpsc;
use tokio::time::timeout;

const READINGS: &str = "/readings/temperature";
const ACTUATORS: &str = "/actuators/room-1";
const WAIT: Duration = Duration::from_secs(2);

fn config() -> ControllerConfig {
    ControllerConfig::new("loopback", READINGS, ACTUATORS, 22.0)
}

fn controller(broker: &LoopbackBroker) -> Controller {
    Controller::with_transport(config(), Arc::new(broker.clone()))
}

async fn wait_for_state(handle: &RunHandle, expected: ControllerState) {
    let mut states = handle.state_changes();
    let reached = timeout(WAIT, states.wait_for(|state| *state == expected))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    assert!(reached, "controller never reached {expected}");
}

async fn next_command(commands: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> String {
    let payload = timeout(WAIT, commands.recv())
        .await
        .expect("no actuation command published")
        .expect("watch channel closed");
    String::from_utf8(payload).unwrap()
}

#[tokio::test]
async fn warm_reading_closes_the_valve() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.inject(
        READINGS,
        br#"{"sensorID": "sensor-1", "type": "temperature", "value": 25.3}"#,
    );
    assert_eq!(next_command(&mut commands).await, r#"{"level":0}"#);

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn cold_reading_opens_the_valve() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.inject(
        READINGS,
        br#"{"sensorID": "sensor-2", "type": "temperature", "value": 18.0}"#,
    );
    assert_eq!(next_command(&mut commands).await, r#"{"level":100}"#);

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn malformed_message_does_not_stop_dispatch() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.inject(READINGS, br#"{"sensorID": "s1", "value": "not-a-number"}"#);
    broker.inject(READINGS, b"definitely not json");
    broker.inject(
        READINGS,
        br#"{"sensorID": "s1", "type": "temperature", "value": 30}"#,
    );

    assert_eq!(next_command(&mut commands).await, r#"{"level":0}"#);
    assert_eq!(controller.state(), ControllerState::Connected);
    assert!(handle.try_next_error().is_none());

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn reading_on_target_publishes_nothing() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.inject(
        READINGS,
        br#"{"sensorID": "s1", "type": "temperature", "value": 22.0}"#,
    );
    broker.inject(
        READINGS,
        br#"{"sensorID": "s1", "type": "temperature", "value": 10}"#,
    );

    // Only the second reading yields a command
    assert_eq!(next_command(&mut commands).await, r#"{"level":100}"#);
    assert!(timeout(Duration::from_millis(200), commands.recv())
        .await
        .is_err());

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn stop_unsubscribes_and_disconnects_exactly_once() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    assert!(handle.request_stop());
    assert!(!handle.request_stop());
    timeout(WAIT, handle.await_completion())
        .await
        .expect("controller did not complete");

    assert!(handle.is_complete());
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(
        broker.calls(),
        CallCounts {
            connect: 1,
            subscribe: 1,
            publish: 0,
            unsubscribe: 1,
            disconnect: 1,
        }
    );
    assert!(handle.next_error().await.is_none());

    // Nothing is subscribed any more, so a late reading reaches no one
    assert_eq!(broker.subscription_count(), 0);
    broker.inject(
        READINGS,
        br#"{"sensorID": "late", "type": "temperature", "value": 1}"#,
    );
    assert!(timeout(Duration::from_millis(200), commands.recv())
        .await
        .is_err());
    assert_eq!(broker.calls().publish, 0);
}

#[tokio::test]
async fn connect_failure_is_reported_once_without_subscribing() {
    let broker = LoopbackBroker::new();
    broker.fail_connect(TransportError::Refused("connection refused".into()));
    let controller = controller(&broker);
    let mut handle = controller.run();

    let error = timeout(WAIT, handle.next_error())
        .await
        .expect("no error reported")
        .expect("error stream closed");
    assert!(matches!(
        error,
        RunError::Startup(ConnectionError::Connect { .. })
    ));

    timeout(WAIT, handle.await_completion())
        .await
        .expect("controller did not complete");
    assert!(handle.next_error().await.is_none());
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(broker.calls().subscribe, 0);
}

#[tokio::test]
async fn subscribe_failure_releases_the_connection() {
    let broker = LoopbackBroker::new();
    broker.fail_subscribe(TransportError::NotAcknowledged("suback failure".into()));
    let controller = controller(&broker);
    let mut handle = controller.run();

    let error = timeout(WAIT, handle.next_error()).await.unwrap().unwrap();
    assert!(matches!(
        error,
        RunError::Startup(ConnectionError::Subscribe { ref topic, .. }) if topic == READINGS
    ));

    handle.await_completion().await;
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(broker.calls().disconnect, 1);
    assert_eq!(broker.calls().unsubscribe, 0);
}

#[tokio::test]
async fn unsubscribe_failure_still_disconnects() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.fail_unsubscribe(TransportError::Timeout(1000));
    handle.request_stop();
    handle.await_completion().await;

    let error = handle.next_error().await.unwrap();
    assert!(matches!(
        error,
        RunError::Shutdown(ShutdownError::Unsubscribe { .. })
    ));
    assert!(!error.is_fatal());
    assert!(handle.next_error().await.is_none());
    assert_eq!(broker.calls().disconnect, 1);
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn publish_failure_is_not_fatal() {
    let broker = LoopbackBroker::new();
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.fail_publish(TransportError::NotAcknowledged("no puback".into()));
    broker.inject(
        READINGS,
        br#"{"sensorID": "s1", "type": "temperature", "value": 30}"#,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.calls().publish, 1);

    broker.heal();
    broker.inject(
        READINGS,
        br#"{"sensorID": "s1", "type": "temperature", "value": 12}"#,
    );
    assert_eq!(next_command(&mut commands).await, r#"{"level":100}"#);
    assert_eq!(controller.state(), ControllerState::Connected);
    assert!(handle.try_next_error().is_none());

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn transport_fault_fails_the_run() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    broker.sever(TransportError::Closed("broker went away".into()));

    let error = timeout(WAIT, handle.next_error()).await.unwrap().unwrap();
    assert!(matches!(error, RunError::Fault(TransportError::Closed(_))));
    handle.await_completion().await;
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(broker.calls().unsubscribe, 0);
    assert_eq!(broker.calls().disconnect, 1);
}

#[tokio::test]
async fn second_run_while_active_is_rejected() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);
    let mut first = controller.run();
    wait_for_state(&first, ControllerState::Connected).await;

    let mut second = controller.run();
    assert_eq!(second.next_error().await, Some(RunError::AlreadyRunning));
    second.await_completion().await;
    assert!(second.is_complete());
    assert_eq!(controller.state(), ControllerState::Connected);
    assert_eq!(broker.calls().connect, 1);

    first.request_stop();
    first.await_completion().await;

    // A stopped controller can be run again
    let mut third = controller.run();
    wait_for_state(&third, ControllerState::Connected).await;
    third.request_stop();
    third.await_completion().await;
    assert_eq!(broker.calls().connect, 2);
}

#[tokio::test]
async fn dropping_the_handle_stops_the_controller() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);
    let handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    let mut states = controller.state_changes();
    drop(handle);
    let stopped = timeout(WAIT, states.wait_for(|state| *state == ControllerState::Stopped))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    assert!(stopped);
    assert_eq!(broker.calls().disconnect, 1);
}

#[tokio::test]
async fn slow_publishes_do_not_block_later_readings() {
    let broker = LoopbackBroker::new();
    broker.set_publish_delay(Some(Duration::from_millis(500)));
    let mut commands = broker.watch(ACTUATORS);
    let controller = controller(&broker);
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    let started = Instant::now();
    for value in [10, 30, 11, 31] {
        let payload = format!(r#"{{"sensorID":"s","type":"temperature","value":{value}}}"#);
        broker.inject(READINGS, payload.as_bytes());
    }
    for _ in 0..4 {
        next_command(&mut commands).await;
    }
    // Serial handling would need at least 2s
    assert!(started.elapsed() < Duration::from_millis(1500));

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn dispatch_limit_bounds_concurrency() {
    let broker = LoopbackBroker::new();
    broker.set_publish_delay(Some(Duration::from_millis(150)));
    let mut commands = broker.watch(ACTUATORS);
    let config = ControllerConfig {
        max_concurrent_dispatches: NonZeroUsize::new(1),
        ..config()
    };
    let controller = Controller::with_transport(config, Arc::new(broker.clone()));
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    let started = Instant::now();
    for _ in 0..3 {
        broker.inject(
            READINGS,
            br#"{"sensorID":"s","type":"temperature","value":5}"#,
        );
    }
    for _ in 0..3 {
        next_command(&mut commands).await;
    }
    assert!(started.elapsed() >= Duration::from_millis(450));

    handle.request_stop();
    handle.await_completion().await;
}

#[tokio::test]
async fn queued_readings_are_dropped_once_stopping() {
    let broker = LoopbackBroker::new();
    broker.set_publish_delay(Some(Duration::from_millis(200)));
    let mut commands = broker.watch(ACTUATORS);
    let config = ControllerConfig {
        max_concurrent_dispatches: NonZeroUsize::new(1),
        ..config()
    };

    let decisions = Arc::new(AtomicUsize::new(0));
    let counter = decisions.clone();
    let controller = Controller::with_transport(config, Arc::new(broker.clone())).with_policy(
        move |_: &Reading, _: f64| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(ActuationCommand::OPEN)
        },
    );
    let mut handle = controller.run();
    wait_for_state(&handle, ControllerState::Connected).await;

    for _ in 0..5 {
        broker.inject(
            READINGS,
            br#"{"sensorID":"s","type":"temperature","value":5}"#,
        );
    }
    next_command(&mut commands).await;

    handle.request_stop();
    handle.await_completion().await;
    assert_eq!(controller.state(), ControllerState::Stopped);
    let at_completion = decisions.load(Ordering::SeqCst);
    assert!(at_completion < 5, "all {at_completion} queued readings ran");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(decisions.load(Ordering::SeqCst), at_completion);
}
