//! Control policies mapping a reading onto an actuation command
//!
//! A policy is a pure decision: no I/O, no state. Any
//! `Fn(&Reading, f64) -> Option<ActuationCommand>` closure is a policy too.

use crate::message::{ActuationCommand, Reading};

pub trait Policy: Send + Sync {
    /// Returns the command to publish for `reading`, or `None` when no action is needed
    fn decide(&self, reading: &Reading, target: f64) -> Option<ActuationCommand>;
}

impl<F> Policy for F
where
    F: Fn(&Reading, f64) -> Option<ActuationCommand> + Send + Sync,
{
    fn decide(&self, reading: &Reading, target: f64) -> Option<ActuationCommand> {
        self(reading, target)
    }
}

/// Bang-bang valve control around a target temperature
///
/// Opens the valve fully below the target and closes it above. A reading exactly on target
/// (or a NaN on either side) leaves the valve alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPolicy;

impl Policy for ThresholdPolicy {
    fn decide(&self, reading: &Reading, target: f64) -> Option<ActuationCommand> {
        if reading.value < target {
            Some(ActuationCommand::OPEN)
        } else if reading.value > target {
            Some(ActuationCommand::CLOSED)
        } else {
            None
        }
    }
}
