//! JSON codec for readings and actuation commands

use serde::Deserialize;

use super::{ActuationCommand, Reading};
use crate::error::DecodeError;

#[derive(Deserialize)]
struct CommandFrame {
    level: i64,
}

/// Parses a reading. Unknown fields are ignored; missing or mistyped ones are not.
pub fn decode_reading(payload: &[u8]) -> Result<Reading, DecodeError> {
    let reading: Reading = serde_json::from_slice(payload)?;
    if reading.sensor_id.is_empty() {
        return Err(DecodeError::EmptySensorId);
    }
    Ok(reading)
}

pub fn encode_reading(reading: &Reading) -> Vec<u8> {
    // Non-finite values have no JSON form and encode as null, which decode rejects.
    serde_json::to_vec(reading).unwrap_or_default()
}

pub fn encode_command(command: &ActuationCommand) -> Vec<u8> {
    serde_json::to_vec(command).unwrap_or_default()
}

pub fn decode_command(payload: &[u8]) -> Result<ActuationCommand, DecodeError> {
    let frame: CommandFrame = serde_json::from_slice(payload)?;
    ActuationCommand::new(frame.level)
}
