//! # Control
//!
//! Closed-loop and manual control of the bath.
//!
//! - [`pid`] - PID controller sampling the bath temperature through an
//!   injected input source.
//! - [`heater`] - Zero-crossing aware time-proportioning of the heater relay.
//! - [`motor`] - Stirring motor duty-cycle sink.
//! - [`buttons`] - Debounced push-button panel.

pub mod buttons;
pub mod heater;
pub mod motor;
pub mod pid;

pub use buttons::{ButtonAction, ButtonPanel};
pub use heater::{on_interval, DutyBudget, HeaterActuator, HeaterSettings, HeaterTelemetry};
pub use motor::Motor;
pub use pid::{InputSource, PidController, PidGains, PidSettings, PidUpdate, SharedValue};

use crate::hardware::{FaultStatus, HardwareError, SensorError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),
    #[error("Sensor reports fault: {0}")]
    SensorFault(FaultStatus),
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("Setpoint must be non-negative, got {0}")]
    NegativeSetpoint(f64),
    #[error("Setpoint must be finite, got {0}")]
    NonFiniteSetpoint(f64),
    #[error("Controller input must be finite, got {0}")]
    NonFiniteInput(f64),
    #[error("PID gains must be finite, got {0:?}")]
    NonFiniteGains(PidGains),
    #[error("Invalid output limits: {min} >= {max}")]
    InvalidLimits { min: f64, max: f64 },
    #[error("Sampling interval must be positive")]
    ZeroInterval,
    #[error("Motor duty-cycle range must be greater than 10, got {0}")]
    InvalidRange(u32),
}
