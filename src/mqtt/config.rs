use std::time::Duration;

use crate::config::ControllerConfig;

/// rumqttc rejects keep-alive intervals shorter than this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Capacity of the request channel between client handle and event loop
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for MqttSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            request_capacity: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_is_clamped() {
        let config = ControllerConfig {
            keep_alive_secs: 1,
            ..ControllerConfig::default()
        };
        assert_eq!(MqttSettings::from(&config).keep_alive, Duration::from_secs(5));
    }
}
