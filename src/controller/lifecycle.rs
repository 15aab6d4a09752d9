//! Lifecycle task of a running controller
//!
//! The sequence connect → subscribe → wait for stop → unsubscribe → disconnect is encoded as a
//! statum state machine, so each step is only callable from the state that precedes it:
//!
//! ```text
//! Connecting ──establish──► Connected ──serve──► ShuttingDown ──teardown──► Stopped
//!      │                        │
//!      └────────────────────────┴──────────► Failed ──terminate──► (task ends)
//! ```
//!
//! The machine owns the connection while it runs. The controller's shared slot mirrors it between
//! `establish` and the end of `teardown` so dispatch tasks can publish.

use std::sync::Arc;

use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::controller::{Controller, ControllerState};
use crate::error::{ConnectionError, RunError, ShutdownError, TransportError};
use crate::mqtt::Connection;

#[state]
#[derive(Debug, Clone)]
pub enum LifecycleState {
    Connecting,
    Connected,
    ShuttingDown,
    Stopped,
    Failed,
}

#[machine]
pub struct Lifecycle<S: LifecycleState> {
    controller: Controller,
    errors: mpsc::UnboundedSender<RunError>,
    connection: Option<Arc<dyn Connection>>,
    failure: Option<RunError>,
}

impl<S: LifecycleState> Lifecycle<S> {
    fn report(&self, error: RunError) {
        if self.errors.send(error).is_err() {
            debug!("Run handle gone, error not delivered");
        }
    }
}

/// Body of the task spawned by [`Controller::run`]
pub(crate) async fn drive(
    controller: Controller,
    errors: mpsc::UnboundedSender<RunError>,
    stop: oneshot::Receiver<()>,
) {
    let connecting = Lifecycle::begin(controller, errors);

    let connected = match connecting.establish().await {
        Ok(connected) => connected,
        Err(failed) => return failed.terminate().await,
    };

    match connected.serve(stop).await {
        Ok(shutting_down) => {
            shutting_down.teardown().await;
        }
        Err(failed) => failed.terminate().await,
    }
}

impl Lifecycle<Connecting> {
    pub fn begin(controller: Controller, errors: mpsc::UnboundedSender<RunError>) -> Self {
        Self::new(controller, errors, None, None)
    }

    /// Connects and subscribes. Both must succeed before the controller counts as connected.
    pub async fn establish(mut self) -> Result<Lifecycle<Connected>, Lifecycle<Failed>> {
        let config = self.controller.config().clone();

        info!("Connecting to MQTT broker at {}", config.broker_address);
        let connection = match self
            .controller
            .transport()
            .connect(&config.broker_address)
            .await
        {
            Ok(connection) => connection,
            Err(source) => {
                self.failure = Some(
                    ConnectionError::Connect {
                        address: config.broker_address.clone(),
                        source,
                    }
                    .into(),
                );
                return Err(self.transition());
            }
        };
        info!("Connected to MQTT broker");
        self.connection = Some(connection.clone());

        info!("Subscribing to readings topic {}", config.readings_topic);
        let handler = self.controller.message_handler();
        if let Err(source) = connection.subscribe(&config.readings_topic, handler).await {
            self.failure = Some(
                ConnectionError::Subscribe {
                    topic: config.readings_topic.clone(),
                    source,
                }
                .into(),
            );
            return Err(self.transition());
        }

        self.controller.attach(connection).await;
        self.controller.transition_to(ControllerState::Connected);
        info!("Controller ready");
        Ok(self.transition())
    }
}

enum Wakeup {
    Stop { requested: bool },
    Fault(TransportError),
}

async fn wait_for_fault(connection: Option<Arc<dyn Connection>>) -> TransportError {
    match connection {
        Some(connection) => connection.fault().await,
        None => std::future::pending().await,
    }
}

impl Lifecycle<Connected> {
    /// Waits until the stop signal arrives or the transport dies
    ///
    /// Dropping the stop sender counts as a stop request, otherwise nobody could end the run.
    pub async fn serve(
        mut self,
        stop: oneshot::Receiver<()>,
    ) -> Result<Lifecycle<ShuttingDown>, Lifecycle<Failed>> {
        let wakeup = tokio::select! {
            received = stop => Wakeup::Stop { requested: received.is_ok() },
            fault = wait_for_fault(self.connection.clone()) => Wakeup::Fault(fault),
        };

        match wakeup {
            Wakeup::Stop { requested } => {
                if requested {
                    info!("Stopping controller");
                } else {
                    warn!("Run handle dropped, stopping controller");
                }
                self.controller.transition_to(ControllerState::ShuttingDown);
                Ok(self.transition())
            }
            Wakeup::Fault(cause) => {
                error!("Lost connection to MQTT broker: {}", cause);
                self.failure = Some(RunError::Fault(cause));
                Err(self.transition())
            }
        }
    }
}

impl Lifecycle<ShuttingDown> {
    /// Unsubscribes and disconnects. Failures are reported; the controller stops regardless.
    pub async fn teardown(mut self) -> Lifecycle<Stopped> {
        let config = self.controller.config().clone();

        if let Some(connection) = self.connection.take() {
            info!("Unsubscribing from readings topic");
            if let Err(source) = connection.unsubscribe(&config.readings_topic).await {
                let error = ShutdownError::Unsubscribe {
                    topic: config.readings_topic.clone(),
                    source,
                };
                warn!("{}", error);
                self.report(error.into());
            }

            info!("Disconnecting from MQTT broker");
            if let Err(source) = connection.disconnect(config.disconnect_timeout()).await {
                let error = ShutdownError::Disconnect(source);
                warn!("{}", error);
                self.report(error.into());
            }
        }

        self.controller.detach().await;
        self.controller.transition_to(ControllerState::Stopped);
        info!("Controller stopped");
        self.transition()
    }
}

impl Lifecycle<Failed> {
    /// Releases whatever was acquired and reports the failure once
    pub async fn terminate(mut self) {
        self.controller.detach().await;
        self.controller.transition_to(ControllerState::Failed);

        if let Some(connection) = self.connection.take() {
            debug!("Releasing connection of failed controller");
            let timeout = self.controller.config().disconnect_timeout();
            if let Err(e) = connection.disconnect(timeout).await {
                debug!("Disconnect after failure: {}", e);
            }
        }

        if let Some(failure) = self.failure.take() {
            error!("Controller failed: {}", failure);
            self.report(failure);
        }
    }
}

impl Lifecycle<Stopped> {}
