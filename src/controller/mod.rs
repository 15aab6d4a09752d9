//! Heating controller lifecycle
//!
//! 1. [`controller`] - Controller handle, per-message dispatch and observable state
//! 2. [`lifecycle`] - Connect / serve / teardown state machine run on its own task
//! 3. [`run_handle`] - Stop signal, error stream and completion token of a run
//!
//! # Architecture
//!
//! ```text
//! readings topic ──► handler ──spawn──► decode ──► policy ──► publish ──► actuators topic
//!                       ▲                                        │
//!                  (Connected only)                        (awaits PUBACK)
//! ```

#[allow(clippy::module_inception)]
pub mod controller;
mod lifecycle;
pub mod run_handle;

pub use controller::{Controller, ControllerState, DispatchOutcome};
pub use run_handle::RunHandle;
