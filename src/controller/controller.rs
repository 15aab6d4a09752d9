use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::lifecycle;
use super::run_handle::RunHandle;
use crate::config::ControllerConfig;
use crate::error::{DecodeError, PublishError, RunError};
use crate::message::{decode_reading, encode_command, ActuationCommand, Reading};
use crate::mqtt::{Connection, MessageHandler, MqttSettings, MqttTransport, Transport};
use crate::policy::{Policy, ThresholdPolicy};

/// Observable lifecycle state of a [`Controller`]
///
/// ```text
/// Idle ──► Connecting ──► Connected ──► ShuttingDown ──► Stopped
///              │              │
///              └──────────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    Connected,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ControllerState {
    /// Whether a lifecycle task currently owns this controller
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ControllerState::Connecting | ControllerState::Connected | ControllerState::ShuttingDown
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "Idle",
            ControllerState::Connecting => "Connecting",
            ControllerState::Connected => "Connected",
            ControllerState::ShuttingDown => "ShuttingDown",
            ControllerState::Stopped => "Stopped",
            ControllerState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// What happened to a single reading
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Payload could not be decoded and was dropped
    Discarded(DecodeError),
    /// Target already reached, nothing published
    NoAction,
    /// Controller left `Connected` before the message got its turn
    Skipped(ControllerState),
    Published(ActuationCommand),
    PublishFailed {
        command: ActuationCommand,
        error: PublishError,
    },
}

/// Heating controller bound to one broker and one pair of topics
///
/// Cloning is cheap and every clone drives the same controller. Construction performs no I/O;
/// the broker is contacted only once [`Controller::run`] is called.
#[derive(Clone)]
pub struct Controller {
    config: Arc<ControllerConfig>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn Policy>,
    /// Written only by the lifecycle task
    connection: Arc<RwLock<Option<Arc<dyn Connection>>>>,
    state: Arc<watch::Sender<ControllerState>>,
    dispatch_limit: Option<Arc<Semaphore>>,
}

impl Controller {
    /// Controller talking MQTT to `config.broker_address` with the threshold policy
    pub fn new(config: ControllerConfig) -> Self {
        let transport = MqttTransport::new(MqttSettings::from(&config));
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        let dispatch_limit = config
            .max_concurrent_dispatches
            .map(|limit| Arc::new(Semaphore::new(limit.get())));
        let (state, _) = watch::channel(ControllerState::Idle);

        Self {
            config: Arc::new(config),
            transport,
            policy: Arc::new(ThresholdPolicy),
            connection: Arc::new(RwLock::new(None)),
            state: Arc::new(state),
            dispatch_limit,
        }
    }

    pub fn with_policy(mut self, policy: impl Policy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Starts the lifecycle on the current tokio runtime and returns without waiting for it
    pub fn run(&self) -> RunHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = ControllerState::Connecting;
                true
            }
        });

        if !claimed {
            warn!("Controller is already running, ignoring run request");
            let _ = error_tx.send(RunError::AlreadyRunning);
            return RunHandle::new(stop_tx, error_rx, self.state.subscribe(), None);
        }

        info!("Controller started");
        let task = tokio::spawn(lifecycle::drive(self.clone(), error_tx, stop_rx));
        RunHandle::new(stop_tx, error_rx, self.state.subscribe(), Some(task))
    }

    /// Decodes a raw reading and processes it
    pub async fn handle_payload(&self, payload: &[u8]) -> DispatchOutcome {
        match decode_reading(payload) {
            Ok(reading) => self.process_reading(&reading).await,
            Err(e) => {
                warn!("Error parsing reading, message discarded: {}", e);
                DispatchOutcome::Discarded(e)
            }
        }
    }

    /// Runs the policy on `reading` and publishes the resulting command, if any
    ///
    /// Works without a live connection too: the publish then fails with
    /// [`PublishError::NotConnected`], which is logged and returned.
    pub async fn process_reading(&self, reading: &Reading) -> DispatchOutcome {
        debug!(
            "Received reading: sensor {} temp {}",
            reading.sensor_id, reading.value
        );

        let Some(command) = self.policy.decide(reading, self.config.target_value) else {
            debug!("Target temperature {} reached", self.config.target_value);
            return DispatchOutcome::NoAction;
        };

        debug!("Actuation: {} (level {})", command, command.level());
        match self.publish(command).await {
            Ok(()) => {
                debug!("Command acknowledged on {}", self.config.actuators_topic);
                DispatchOutcome::Published(command)
            }
            Err(error) => {
                warn!("Failed to publish actuation command: {}", error);
                DispatchOutcome::PublishFailed { command, error }
            }
        }
    }

    async fn publish(&self, command: ActuationCommand) -> Result<(), PublishError> {
        let connection = self.connection.read().await.clone();
        let Some(connection) = connection else {
            return Err(PublishError::NotConnected);
        };

        connection
            .publish(&self.config.actuators_topic, encode_command(&command))
            .await
            .map_err(|source| PublishError::Transport {
                topic: self.config.actuators_topic.clone(),
                source,
            })
    }

    /// Handler registered on the readings subscription
    ///
    /// Each message gets its own task so a slow policy or publish never holds up the next one.
    pub(crate) fn message_handler(&self) -> MessageHandler {
        let controller = self.clone();
        Arc::new(move |payload: Vec<u8>| {
            let state = controller.state();
            if state != ControllerState::Connected {
                debug!("Dropping message received while {}", state);
                return;
            }

            let controller = controller.clone();
            tokio::spawn(async move {
                controller.dispatch(payload).await;
            });
        })
    }

    async fn dispatch(&self, payload: Vec<u8>) -> DispatchOutcome {
        let _permit = match &self.dispatch_limit {
            Some(limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };

        // The permit may arrive after teardown began
        let state = self.state();
        if state != ControllerState::Connected {
            debug!("Skipping message queued before {}", state);
            return DispatchOutcome::Skipped(state);
        }
        self.handle_payload(&payload).await
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) async fn attach(&self, connection: Arc<dyn Connection>) {
        *self.connection.write().await = Some(connection);
    }

    pub(crate) async fn detach(&self) {
        self.connection.write().await.take();
    }

    pub(crate) fn transition_to(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        info!("Controller state {} -> {}", previous, next);
    }
}
