//! # Daemon Configuration
//!
//! Every setting lives in one TOML file. Missing sections and fields fall
//! back to the defaults below, so an empty file is a valid configuration for
//! a 1000 Ω RTD, a 3600 Ω reference and a 50 Hz mains supply.
//!
//! ## Example
//!
//! ```toml
//! [calibration]
//! r0 = 1000.0
//! reference_resistance = 3600.0
//!
//! [pid]
//! setpoint = 56.5
//! kp = 0.2
//! ki = 0.002
//! kd = 2.0
//! sample_interval_ms = 1000
//!
//! [heater]
//! period_ms = 200
//! mains_frequency_hz = 50.0
//! ```

// src/config.rs - Single configuration file
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::RtdParameters;
use crate::control::{HeaterSettings, PidGains, PidSettings};
use crate::hardware::sim::BathParameters;
use crate::hardware::{NoiseFilter, SensorConfig, Wiring};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub sensor: Max31865Config,
    #[serde(default)]
    pub pid: PidConfig,
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub motor: MotorConfig,
    #[serde(default)]
    pub buttons: ButtonsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// RTD element and the temperature window of the lookup table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_r0")]
    pub r0: f64,
    #[serde(default = "default_reference_resistance")]
    pub reference_resistance: f64,
    #[serde(default = "default_temperature_min")]
    pub temperature_min: f64,
    #[serde(default = "default_temperature_max")]
    pub temperature_max: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            r0: default_r0(),
            reference_resistance: default_reference_resistance(),
            temperature_min: default_temperature_min(),
            temperature_max: default_temperature_max(),
        }
    }
}

impl CalibrationConfig {
    pub fn parameters(&self) -> RtdParameters {
        RtdParameters {
            r0: self.r0,
            reference_resistance: self.reference_resistance,
            temperature_min: self.temperature_min,
            temperature_max: self.temperature_max,
        }
    }
}

/// MAX31865 wiring on the SPI bus.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Max31865Config {
    #[serde(default)]
    pub spi_bus: u8,
    #[serde(default)]
    pub chip_select: u8,
    #[serde(default = "default_spi_clock_hz")]
    pub clock_hz: u32,
    /// BCM pin of the DRDY line. Without one the sensor is polled once per
    /// conversion period.
    #[serde(default = "default_data_ready_pin")]
    pub data_ready_pin: Option<u8>,
    #[serde(default = "default_wiring")]
    pub wiring: Wiring,
}

impl Default for Max31865Config {
    fn default() -> Self {
        Self {
            spi_bus: 0,
            chip_select: 0,
            clock_hz: default_spi_clock_hz(),
            data_ready_pin: default_data_ready_pin(),
            wiring: default_wiring(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PidConfig {
    #[serde(default = "default_setpoint")]
    pub setpoint: f64,
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub output_min: f64,
    #[serde(default = "default_output_max")]
    pub output_max: f64,
    #[serde(default)]
    pub setpoint_min: f64,
    #[serde(default = "default_setpoint_max")]
    pub setpoint_max: f64,
    /// Setpoint change per button press, °C.
    #[serde(default = "default_setpoint_step")]
    pub setpoint_step: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            setpoint: default_setpoint(),
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            sample_interval_ms: default_sample_interval_ms(),
            output_min: 0.0,
            output_max: default_output_max(),
            setpoint_min: 0.0,
            setpoint_max: default_setpoint_max(),
            setpoint_step: default_setpoint_step(),
        }
    }
}

impl PidConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn settings(&self) -> PidSettings {
        PidSettings {
            setpoint: self.setpoint,
            gains: PidGains {
                kp: self.kp,
                ki: self.ki,
                kd: self.kd,
            },
            interval: self.interval(),
            output_min: self.output_min,
            output_max: self.output_max,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    #[serde(default = "default_relay_pin")]
    pub relay_pin: u8,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default = "default_heater_period_ms")]
    pub period_ms: u64,
    /// Also selects the sensor's mains noise filter.
    #[serde(default = "default_mains_frequency_hz")]
    pub mains_frequency_hz: f64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            relay_pin: default_relay_pin(),
            active_low: false,
            period_ms: default_heater_period_ms(),
            mains_frequency_hz: default_mains_frequency_hz(),
        }
    }
}

impl HeaterConfig {
    pub fn settings(&self) -> HeaterSettings {
        HeaterSettings::new(Duration::from_millis(self.period_ms), self.mains_frequency_hz)
    }

    pub fn noise_filter(&self) -> NoiseFilter {
        if (self.mains_frequency_hz - 60.0).abs() < 1.0 {
            NoiseFilter::Hz60
        } else {
            NoiseFilter::Hz50
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotorConfig {
    #[serde(default)]
    pub pwm_channel: u8,
    #[serde(default = "default_motor_frequency_hz")]
    pub frequency_hz: f64,
    #[serde(default = "default_duty_cycle_range")]
    pub duty_cycle_range: u32,
    #[serde(default = "default_initial_duty_cycle")]
    pub initial_duty_cycle: u32,
    /// Duty-cycle change per button press.
    #[serde(default = "default_duty_cycle_step")]
    pub duty_cycle_step: u32,
    #[serde(default = "default_true")]
    pub start_on_launch: bool,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            pwm_channel: 0,
            frequency_hz: default_motor_frequency_hz(),
            duty_cycle_range: default_duty_cycle_range(),
            initial_duty_cycle: default_initial_duty_cycle(),
            duty_cycle_step: default_duty_cycle_step(),
            start_on_launch: true,
        }
    }
}

/// BCM pins of the four panel buttons.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ButtonsConfig {
    #[serde(default = "default_increase_temperature_pin")]
    pub increase_temperature_pin: u8,
    #[serde(default = "default_decrease_temperature_pin")]
    pub decrease_temperature_pin: u8,
    #[serde(default = "default_increase_motor_pin")]
    pub increase_motor_pin: u8,
    #[serde(default = "default_decrease_motor_pin")]
    pub decrease_motor_pin: u8,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ButtonsConfig {
    fn default() -> Self {
        Self {
            increase_temperature_pin: default_increase_temperature_pin(),
            decrease_temperature_pin: default_decrease_temperature_pin(),
            increase_motor_pin: default_increase_motor_pin(),
            decrease_motor_pin: default_decrease_motor_pin(),
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// How often a status line is logged.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

/// Thermal model used with `--simulate`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_ambient")]
    pub ambient: f64,
    #[serde(default = "default_ambient")]
    pub initial_temperature: f64,
    #[serde(default = "default_heating_rate")]
    pub heating_rate: f64,
    #[serde(default = "default_loss_coefficient")]
    pub loss_coefficient: f64,
    #[serde(default = "default_noise")]
    pub noise: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ambient: default_ambient(),
            initial_temperature: default_ambient(),
            heating_rate: default_heating_rate(),
            loss_coefficient: default_loss_coefficient(),
            noise: default_noise(),
        }
    }
}

impl SimulationConfig {
    pub fn parameters(&self, calibration: &CalibrationConfig) -> BathParameters {
        BathParameters {
            r0: calibration.r0,
            reference_resistance: calibration.reference_resistance,
            ambient: self.ambient,
            initial_temperature: self.initial_temperature,
            heating_rate: self.heating_rate,
            loss_coefficient: self.loss_coefficient,
            noise: self.noise,
        }
    }
}

impl Config {
    /// Configuration written to the MAX31865 at startup.
    pub fn sensor_configuration(&self) -> SensorConfig {
        SensorConfig::continuous(self.sensor.wiring, self.heater.noise_filter())
    }

    /// Check value ranges and cross-section consistency. Combinations that
    /// work but waste precision are only logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cal = &self.calibration;
        if cal.r0 <= 0.0 {
            return Err(invalid(format!("calibration.r0 must be > 0, got {}", cal.r0)));
        }
        if cal.reference_resistance < cal.r0 {
            return Err(invalid(format!(
                "calibration.reference_resistance ({}) must not be below r0 ({})",
                cal.reference_resistance, cal.r0
            )));
        }
        if cal.temperature_min >= cal.temperature_max {
            return Err(invalid("calibration.temperature_min must be below temperature_max"));
        }

        if self.sensor.clock_hz == 0 {
            return Err(invalid("sensor.clock_hz must be > 0"));
        }

        let pid = &self.pid;
        if pid.sample_interval_ms == 0 {
            return Err(invalid("pid.sample_interval_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&pid.output_min)
            || !(0.0..=1.0).contains(&pid.output_max)
            || pid.output_min >= pid.output_max
        {
            return Err(invalid(format!(
                "pid output limits must satisfy 0 <= min < max <= 1, got [{}, {}]",
                pid.output_min, pid.output_max
            )));
        }
        if pid.setpoint_min < 0.0 || pid.setpoint_min >= pid.setpoint_max {
            return Err(invalid("pid setpoint range must satisfy 0 <= setpoint_min < setpoint_max"));
        }
        if !(pid.setpoint_min..=pid.setpoint_max).contains(&pid.setpoint) {
            return Err(invalid(format!(
                "pid.setpoint {} is outside [{}, {}]",
                pid.setpoint, pid.setpoint_min, pid.setpoint_max
            )));
        }
        if pid.setpoint_step <= 0.0 {
            return Err(invalid("pid.setpoint_step must be > 0"));
        }

        let heater = &self.heater;
        if heater.mains_frequency_hz <= 0.0 {
            return Err(invalid("heater.mains_frequency_hz must be > 0"));
        }
        let settings = heater.settings();
        if settings.period < settings.half_cycle {
            return Err(invalid(format!(
                "heater.period_ms ({}) is shorter than one mains half-cycle",
                heater.period_ms
            )));
        }
        if heater.period_ms > pid.sample_interval_ms {
            return Err(invalid(format!(
                "heater.period_ms ({}) must not exceed pid.sample_interval_ms ({})",
                heater.period_ms, pid.sample_interval_ms
            )));
        }
        if pid.sample_interval_ms % heater.period_ms != 0 {
            tracing::warn!(
                "PID interval {} ms is not a multiple of the heater period {} ms",
                pid.sample_interval_ms,
                heater.period_ms
            );
        }
        let half_cycles = settings.period.as_secs_f64() / settings.half_cycle.as_secs_f64();
        if (half_cycles - half_cycles.round()).abs() > 1e-3 {
            tracing::warn!(
                "Heater period {} ms is not a whole number of mains half-cycles",
                heater.period_ms
            );
        }

        let motor = &self.motor;
        if motor.duty_cycle_range <= crate::control::motor::MIN_RANGE {
            return Err(invalid(format!(
                "motor.duty_cycle_range must be > {}, got {}",
                crate::control::motor::MIN_RANGE,
                motor.duty_cycle_range
            )));
        }
        if motor.initial_duty_cycle > motor.duty_cycle_range {
            return Err(invalid("motor.initial_duty_cycle exceeds duty_cycle_range"));
        }
        if motor.frequency_hz <= 0.0 {
            return Err(invalid("motor.frequency_hz must be > 0"));
        }

        if self.buttons.poll_interval_ms == 0 {
            return Err(invalid("buttons.poll_interval_ms must be > 0"));
        }
        if self.daemon.status_interval_secs == 0 {
            return Err(invalid("daemon.status_interval_secs must be > 0"));
        }
        Ok(())
    }
}

// Default value functions
fn default_r0() -> f64 { 1000.0 }
fn default_reference_resistance() -> f64 { 3600.0 }
fn default_temperature_min() -> f64 { 0.0 }
fn default_temperature_max() -> f64 { 100.0 }
fn default_spi_clock_hz() -> u32 { 1_000_000 }
fn default_data_ready_pin() -> Option<u8> { Some(25) }
fn default_wiring() -> Wiring { Wiring::ThreeWire }
fn default_setpoint() -> f64 { 56.0 }
fn default_kp() -> f64 { 0.2 }
fn default_ki() -> f64 { 0.002 }
fn default_kd() -> f64 { 2.0 }
fn default_sample_interval_ms() -> u64 { 1000 }
fn default_output_max() -> f64 { 1.0 }
fn default_setpoint_max() -> f64 { 95.0 }
fn default_setpoint_step() -> f64 { 0.5 }
fn default_relay_pin() -> u8 { 17 }
fn default_heater_period_ms() -> u64 { 200 }
fn default_mains_frequency_hz() -> f64 { 50.0 }
fn default_motor_frequency_hz() -> f64 { 1000.0 }
fn default_duty_cycle_range() -> u32 { 1000 }
fn default_initial_duty_cycle() -> u32 { 600 }
fn default_duty_cycle_step() -> u32 { 50 }
fn default_true() -> bool { true }
fn default_increase_temperature_pin() -> u8 { 5 }
fn default_decrease_temperature_pin() -> u8 { 6 }
fn default_increase_motor_pin() -> u8 { 13 }
fn default_decrease_motor_pin() -> u8 { 19 }
fn default_debounce_ms() -> u64 { 200 }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_status_interval_secs() -> u64 { 10 }
fn default_ambient() -> f64 { 20.0 }
fn default_heating_rate() -> f64 { 0.05 }
fn default_loss_coefficient() -> f64 { 0.0005 }
fn default_noise() -> f64 { 0.02 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
