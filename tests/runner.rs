use std::sync::Arc;
use std::time::Duration;

use heating_control::config::{ControllerConfig, RunnerSettings};
use heating_control::controller::{Controller, ControllerState};
use heating_control::error::{Phase, RunError, TransportError};
use heating_control::mqtt::LoopbackBroker;
use heating_control::runner::{supervise, Outcome};
use tokio::sync::oneshot;
use tokio::time::timeout;

const READINGS: &str = "/readings/temperature";
const ACTUATORS: &str = "/actuators/room-1";

fn controller(broker: &LoopbackBroker) -> Controller {
    let config = ControllerConfig::new("loopback", READINGS, ACTUATORS, 22.0);
    Controller::with_transport(config, Arc::new(broker.clone()))
}

fn settings() -> RunnerSettings {
    RunnerSettings {
        shutdown_grace_ms: 2000,
    }
}

/// Resolves once the controller is connected, like an operator pressing Ctrl-C mid-run
async fn shutdown_once_connected(controller: &Controller) {
    let mut states = controller.state_changes();
    let _ = states
        .wait_for(|state| *state == ControllerState::Connected)
        .await;
}

#[tokio::test]
async fn shutdown_request_ends_cleanly() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);

    let outcome = timeout(
        Duration::from_secs(5),
        supervise(&controller, shutdown_once_connected(&controller), &settings()),
    )
    .await
    .expect("supervisor hung");

    assert!(outcome.is_clean(), "unexpected outcome {outcome:?}");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(broker.calls().unsubscribe, 1);
    assert_eq!(broker.calls().disconnect, 1);
}

#[tokio::test]
async fn startup_error_ends_the_run_without_stop() {
    let broker = LoopbackBroker::new();
    broker.fail_connect(TransportError::Refused("no broker".into()));
    let controller = controller(&broker);

    // Never resolves: only the controller's error can end this run
    let outcome = supervise(&controller, std::future::pending(), &settings()).await;

    match outcome {
        Outcome::Failed(error) => assert_eq!(error.phase(), Phase::Startup),
        other => panic!("expected a startup failure, got {other:?}"),
    }
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(broker.calls().subscribe, 0);
    assert_eq!(broker.calls().unsubscribe, 0);
}

#[tokio::test]
async fn teardown_errors_are_surfaced() {
    let broker = LoopbackBroker::new();
    broker.fail_disconnect(TransportError::Timeout(1000));
    let controller = controller(&broker);

    let outcome = supervise(&controller, shutdown_once_connected(&controller), &settings()).await;

    match outcome {
        Outcome::StoppedWithErrors(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(matches!(errors[0], RunError::Shutdown(_)));
        }
        other => panic!("expected teardown errors, got {other:?}"),
    }
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn fault_while_running_fails_the_run() {
    let broker = LoopbackBroker::new();
    let controller = controller(&broker);
    let (_keep_alive, never) = oneshot::channel::<()>();

    let severing = {
        let broker = broker.clone();
        let mut states = controller.state_changes();
        tokio::spawn(async move {
            let _ = states
                .wait_for(|state| *state == ControllerState::Connected)
                .await;
            broker.sever(TransportError::Closed("broker restarted".into()));
        })
    };

    let outcome = supervise(
        &controller,
        async move {
            let _ = never.await;
        },
        &settings(),
    )
    .await;
    severing.await.unwrap();

    assert!(matches!(
        outcome,
        Outcome::Failed(RunError::Fault(TransportError::Closed(_)))
    ));
    assert_eq!(outcome.exit_code(), 1);
}
