//! Caller-side view of one [`Controller::run`](super::Controller::run) invocation

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::controller::ControllerState;
use crate::error::RunError;

/// Stop sender, error stream and completion token of one run
///
/// Dropping the handle without calling [`RunHandle::request_stop`] also stops the controller.
#[derive(Debug)]
pub struct RunHandle {
    stop: Option<oneshot::Sender<()>>,
    errors: mpsc::UnboundedReceiver<RunError>,
    state: watch::Receiver<ControllerState>,
    task: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub(crate) fn new(
        stop: oneshot::Sender<()>,
        errors: mpsc::UnboundedReceiver<RunError>,
        state: watch::Receiver<ControllerState>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            stop: Some(stop),
            errors,
            state,
            task,
        }
    }

    /// Sends the stop signal. Only the first call has an effect; later calls return `false`.
    pub fn request_stop(&mut self) -> bool {
        match self.stop.take() {
            Some(stop) => {
                if stop.send(()).is_err() {
                    debug!("Controller already finished before stop request");
                }
                true
            }
            None => {
                warn!("Stop already requested");
                false
            }
        }
    }

    /// Next reported error, or `None` once the lifecycle task has ended and the stream is drained
    pub async fn next_error(&mut self) -> Option<RunError> {
        self.errors.recv().await
    }

    /// Next error if one is already waiting
    pub fn try_next_error(&mut self) -> Option<RunError> {
        self.errors.try_recv().ok()
    }

    pub fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<RunError> {
        &mut self.errors
    }

    /// Resolves once the lifecycle task has fully exited
    ///
    /// Dispatch tasks already running are not waited for. Cancelling this future leaves the
    /// handle intact so it can be awaited again.
    pub async fn await_completion(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                error!("Controller task ended abnormally: {}", e);
            }
            self.task = None;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }
}
