//! # sousvide-rs
//!
//! Temperature controller for a sous vide water bath on a Raspberry Pi: a
//! MAX31865 RTD converter on SPI, a PID loop, a time-proportioned SSR heater,
//! a PWM stirring motor and four panel buttons.
//!
//! - [`calibration`] - Callendar–Van Dusen lookup table from RTD code to °C.
//! - [`hardware`] - Device seams, the MAX31865 driver and the Pi/simulated
//!   backends.
//! - [`control`] - PID controller, heater actuator, motor and buttons.
//! - [`scheduler`] - Clock abstraction and worker threads.
//! - [`sousvide`] - Startup, operator commands and ordered shutdown.
//! - [`config`] - TOML configuration.

pub mod calibration;
pub mod config;
pub mod control;
pub mod hardware;
pub mod scheduler;
pub mod sousvide;
