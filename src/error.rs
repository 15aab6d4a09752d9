//! Error taxonomy for the heating controller
//!
//! Per-message failures ([`DecodeError`], [`PublishError`]) are recovered where they happen and
//! only logged. Lifecycle failures are wrapped in a [`RunError`] tagged with the [`Phase`] they
//! occurred in and reported once on the run's error stream.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("request was not acknowledged: {0}")]
    NotAcknowledged(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("client error: {0}")]
    Client(String),
}

/// Startup failure. Fatal to the run, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Malformed payload. The message is discarded and dispatch continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("sensorID must not be empty")]
    EmptySensorId,

    #[error("actuation level {0} is outside 0..=100")]
    LevelOutOfRange(i64),
}

/// Publishing an actuation command failed. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected to a broker")]
    NotConnected,

    #[error("publish to {topic} failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Teardown failure. Reported, but the controller still reaches `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("failed to unsubscribe from {topic}: {source}")]
    Unsubscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to disconnect: {0}")]
    Disconnect(#[source] TransportError),
}

/// Lifecycle phase an error was reported from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Startup,
    Running,
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Phase::Startup => "startup",
            Phase::Running => "running",
            Phase::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// Error delivered on a [`RunHandle`](crate::controller::RunHandle) error stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("startup failed: {0}")]
    Startup(#[from] ConnectionError),

    #[error("transport fault while running: {0}")]
    Fault(#[source] TransportError),

    #[error("shutdown incomplete: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("controller is already running")]
    AlreadyRunning,
}

impl RunError {
    pub fn phase(&self) -> Phase {
        match self {
            RunError::Startup(_) | RunError::AlreadyRunning => Phase::Startup,
            RunError::Fault(_) => Phase::Running,
            RunError::Shutdown(_) => Phase::Shutdown,
        }
    }

    /// Whether the run ended because of this error
    pub fn is_fatal(&self) -> bool {
        self.phase() != Phase::Shutdown
    }
}

/// Configuration file could not be used
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_tagged_with_their_phase() {
        let startup = RunError::from(ConnectionError::Connect {
            address: "tcp://nowhere:1883".into(),
            source: TransportError::Refused("nope".into()),
        });
        assert_eq!(startup.phase(), Phase::Startup);
        assert!(startup.is_fatal());

        let fault = RunError::Fault(TransportError::Closed("reset by peer".into()));
        assert_eq!(fault.phase(), Phase::Running);
        assert!(fault.is_fatal());

        let teardown = RunError::from(ShutdownError::Disconnect(TransportError::Timeout(1000)));
        assert_eq!(teardown.phase(), Phase::Shutdown);
        assert!(!teardown.is_fatal());
    }

    #[test]
    fn messages_name_the_failing_topic() {
        let err = ShutdownError::Unsubscribe {
            topic: "/readings/temperature".into(),
            source: TransportError::NotAcknowledged("unsuback missing".into()),
        };
        assert!(err.to_string().contains("/readings/temperature"));
    }
}
