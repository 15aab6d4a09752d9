//! Process-level supervision of a controller run
//!
//! Starts the controller, then waits for whichever comes first: an error reported by the
//! controller or an external shutdown request. Only the latter sends the stop signal.

use std::future::Future;

use tracing::{error, info, warn};

use crate::config::RunnerSettings;
use crate::controller::{Controller, RunHandle};
use crate::error::RunError;

/// How a supervised run ended
#[derive(Debug)]
pub enum Outcome {
    /// Stopped on request, teardown went through
    Clean,
    /// Stopped on request, but unsubscribe or disconnect failed
    StoppedWithErrors(Vec<RunError>),
    /// The controller reported a fatal error before any stop request
    Failed(RunError),
    /// The controller did not finish within the grace period
    TimedOut,
}

impl Outcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Clean)
    }

    /// 0 after a clean shutdown, 1 whenever an error was observed
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Runs `controller` until `shutdown` resolves or the controller fails
pub async fn supervise<F>(controller: &Controller, shutdown: F, settings: &RunnerSettings) -> Outcome
where
    F: Future<Output = ()>,
{
    let mut handle = controller.run();
    tokio::pin!(shutdown);

    let first_error = tokio::select! {
        error = handle.next_error() => Some(error),
        _ = &mut shutdown => None,
    };

    match first_error {
        Some(Some(error)) => {
            error!("Got error from controller: {}", error);
            if !settle(&mut handle, settings).await {
                warn!("Controller did not release its resources in time");
            }
            log_remaining(&mut handle);
            Outcome::Failed(error)
        }
        Some(None) => {
            // Lifecycle ended without an error and without a stop request
            warn!("Controller exited on its own");
            settle(&mut handle, settings).await;
            Outcome::Clean
        }
        None => {
            info!("Got shutdown signal");
            handle.request_stop();
            if !settle(&mut handle, settings).await {
                error!(
                    "Controller did not stop within {}ms",
                    settings.shutdown_grace_ms
                );
                return Outcome::TimedOut;
            }

            let teardown_errors = log_remaining(&mut handle);
            if teardown_errors.is_empty() {
                Outcome::Clean
            } else {
                Outcome::StoppedWithErrors(teardown_errors)
            }
        }
    }
}

/// Waits for the lifecycle task within the grace period
async fn settle(handle: &mut RunHandle, settings: &RunnerSettings) -> bool {
    tokio::time::timeout(settings.shutdown_grace(), handle.await_completion())
        .await
        .is_ok()
}

fn log_remaining(handle: &mut RunHandle) -> Vec<RunError> {
    let mut remaining = Vec::new();
    while let Some(error) = handle.try_next_error() {
        warn!("Controller reported during {}: {}", error.phase(), error);
        remaining.push(error);
    }
    remaining
}

/// Completes when the process receives SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere)
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
