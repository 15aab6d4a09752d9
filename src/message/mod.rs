//! Wire types exchanged over the broker
//!
//! ```text
//! readings topic  ──► {"sensorID": "...", "type": "...", "value": 21.5} ──► Reading
//! ActuationCommand ──► {"level": 100} ──► actuators topic
//! ```

pub mod codec;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

pub use codec::{decode_command, decode_reading, encode_command, encode_reading};

/// Temperature observation sent to the controller by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "sensorID")]
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub reading_type: String,
    pub value: f64,
}

impl Reading {
    pub fn new(sensor_id: impl Into<String>, reading_type: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            reading_type: reading_type.into(),
            value,
        }
    }
}

/// Openness level for a valve, always within `0..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActuationCommand {
    level: u8,
}

impl ActuationCommand {
    pub const MAX_LEVEL: u8 = 100;

    /// Fully open valve
    pub const OPEN: Self = Self {
        level: Self::MAX_LEVEL,
    };

    /// Fully closed valve
    pub const CLOSED: Self = Self { level: 0 };

    /// Builds a command from an untrusted level
    ///
    /// Levels reach this from decoded payloads and custom policies alike, so an out-of-range
    /// value is reported as [`DecodeError::LevelOutOfRange`] either way.
    pub fn new(level: i64) -> Result<Self, DecodeError> {
        if (0..=i64::from(Self::MAX_LEVEL)).contains(&level) {
            Ok(Self { level: level as u8 })
        } else {
            Err(DecodeError::LevelOutOfRange(level))
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

impl fmt::Display for ActuationCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.level {
            0 => write!(f, "close valve"),
            Self::MAX_LEVEL => write!(f, "open valve"),
            level => write!(f, "set valve to {}%", level),
        }
    }
}
