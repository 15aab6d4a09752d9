//! Controller and runner configuration
//!
//! Loaded from `<config dir>/heating-control/config.toml`. Every field has a default, so a
//! missing file or a partial one still yields a usable configuration:
//!
//! ```toml
//! [controller]
//! broker_address = "tcp://localhost:1883"
//! readings_topic = "/readings/temperature"
//! actuators_topic = "/actuators/room-1"
//! target_value = 22.0
//!
//! [runner]
//! shutdown_grace_ms = 5000
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

const CONFIG_DIR: &str = "heating-control";
const CONFIG_FILE: &str = "config.toml";

/// Settings of one controller instance, fixed for its lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub broker_address: String,
    pub readings_topic: String,
    pub actuators_topic: String,
    /// Temperature the controller steers towards
    pub target_value: f64,

    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// How long subscribe, unsubscribe and publish wait for the broker's acknowledgement
    pub ack_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Upper bound on readings processed at the same time. Unbounded when unset.
    pub max_concurrent_dispatches: Option<NonZeroUsize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broker_address: "tcp://localhost:1883".to_string(),
            readings_topic: "/readings/temperature".to_string(),
            actuators_topic: "/actuators/room-1".to_string(),
            target_value: 22.0,
            client_id: format!("heating-control-{}", std::process::id()),
            keep_alive_secs: 5,
            connect_timeout_ms: 5000,
            ack_timeout_ms: 5000,
            disconnect_timeout_ms: 1000,
            max_concurrent_dispatches: None,
        }
    }
}

impl ControllerConfig {
    pub fn new(
        broker_address: impl Into<String>,
        readings_topic: impl Into<String>,
        actuators_topic: impl Into<String>,
        target_value: f64,
    ) -> Self {
        Self {
            broker_address: broker_address.into(),
            readings_topic: readings_topic.into(),
            actuators_topic: actuators_topic.into(),
            target_value,
            ..Self::default()
        }
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// How long the runner waits for the controller to finish after a stop or failure
    pub shutdown_grace_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5000,
        }
    }
}

impl RunnerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub runner: RunnerSettings,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads `path`, falling back to defaults when the file does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                info!("Loading configuration from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
