//! # heating-control
//!
//! Subscribes to temperature readings over MQTT, decides per reading whether a valve should open
//! or close, and publishes the resulting actuation commands.
//!
//! ```text
//! config.rs      - TOML configuration with defaults
//! message/       - Reading / ActuationCommand and their JSON codec
//! policy.rs      - Pure decision functions
//! mqtt/          - Transport seam, rumqttc transport, in-process broker
//! controller/    - Lifecycle state machine and per-message dispatch
//! runner.rs      - Supervision of one run, OS signal handling
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use heating_control::config::{ControllerConfig, RunnerSettings};
//! use heating_control::controller::Controller;
//! use heating_control::runner;
//!
//! # async fn demo() {
//! let controller = Controller::new(ControllerConfig::default());
//! let shutdown = async {
//!     let _ = runner::wait_for_shutdown_signal().await;
//! };
//! let outcome = runner::supervise(&controller, shutdown, &RunnerSettings::default()).await;
//! std::process::exit(outcome.exit_code());
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod mqtt;
pub mod policy;
pub mod runner;

pub use config::{AppConfig, ControllerConfig, RunnerSettings};
pub use controller::{Controller, ControllerState, DispatchOutcome, RunHandle};
pub use error::{
    ConnectionError, DecodeError, Phase, PublishError, RunError, ShutdownError, TransportError,
};
pub use message::{ActuationCommand, Reading};
pub use policy::{Policy, ThresholdPolicy};
pub use runner::Outcome;
