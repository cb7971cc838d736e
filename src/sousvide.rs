// src/sousvide.rs - Process context: startup, command surface and shutdown
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::calibration::{CalibrationError, CalibrationTable};
use crate::config::{Config, ConfigError};
use crate::control::{
    ButtonAction, ButtonPanel, ControlError, HeaterActuator, HeaterTelemetry, Motor,
    PidController, PidUpdate, SharedValue,
};
use crate::hardware::{
    AcquisitionMode, Board, HardwareError, Max31865, PwmOutput, SensorError, TemperatureReading,
};
use crate::scheduler::{Clock, StopSignal, Worker};

#[derive(Debug, Error)]
pub enum SousVideError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),
    #[error("Control error: {0}")]
    Control(#[from] ControlError),
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("Failed to send PID update: controller loop has stopped")]
    ControllerStopped,
}

/// Longest wait for the first conversion at startup.
const FIRST_READING_TIMEOUT: Duration = Duration::from_millis(500);

pub type SharedMotor = Arc<Mutex<Motor<Box<dyn PwmOutput>>>>;

fn lock_motor(motor: &SharedMotor) -> MutexGuard<'_, Motor<Box<dyn PwmOutput>>> {
    motor.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn<F>(name: &'static str, body: F) -> Result<Worker, SousVideError>
where
    F: FnOnce(StopSignal) + Send + 'static,
{
    Worker::spawn(name, body).map_err(|source| SousVideError::Spawn { name, source })
}

/// Operator commands: setpoint and stirring adjustments, readouts. Cheap to
/// clone; the button thread owns one copy.
#[derive(Clone)]
pub struct Controls {
    setpoint: SharedValue,
    setpoint_min: f64,
    setpoint_max: f64,
    setpoint_step: f64,
    heater_output: SharedValue,
    motor: SharedMotor,
    motor_step: u32,
    sensor: Arc<Max31865>,
}

impl Controls {
    pub fn setpoint(&self) -> f64 {
        self.setpoint.load()
    }

    fn shift_setpoint(&self, delta: f64) -> f64 {
        if !delta.is_finite() {
            tracing::warn!("Ignoring non-finite setpoint step {}", delta);
            return self.setpoint.load();
        }
        let setpoint = (self.setpoint.load() + delta).clamp(self.setpoint_min, self.setpoint_max);
        self.setpoint.store(setpoint);
        tracing::info!("Setpoint now {:.1} °C", setpoint);
        setpoint
    }

    /// Raise the setpoint, clamped to the configured range. Returns the new
    /// setpoint.
    pub fn increase_setpoint(&self, delta: f64) -> f64 {
        self.shift_setpoint(delta.abs())
    }

    pub fn decrease_setpoint(&self, delta: f64) -> f64 {
        self.shift_setpoint(-delta.abs())
    }

    pub fn increase_motor_duty(&self, delta: u32) -> Result<u32, ControlError> {
        lock_motor(&self.motor).increase_duty_cycle(delta)
    }

    pub fn decrease_motor_duty(&self, delta: u32) -> Result<u32, ControlError> {
        lock_motor(&self.motor).decrease_duty_cycle(delta)
    }

    /// Motor duty cycle as a percentage of its range.
    pub fn duty_cycle_percentage(&self) -> f64 {
        lock_motor(&self.motor).percentage() * 100.0
    }

    pub fn current_temperature(&self) -> Result<TemperatureReading, SensorError> {
        self.sensor.read_temperature()
    }

    /// Last heater duty published by the controller.
    pub fn heater_output(&self) -> f64 {
        self.heater_output.load()
    }

    /// Apply one panel button press with the configured step sizes.
    pub fn handle(&self, action: ButtonAction) {
        match action {
            ButtonAction::IncreaseSetpoint => {
                self.increase_setpoint(self.setpoint_step);
            }
            ButtonAction::DecreaseSetpoint => {
                self.decrease_setpoint(self.setpoint_step);
            }
            ButtonAction::IncreaseMotor | ButtonAction::DecreaseMotor => {
                let result = if action == ButtonAction::IncreaseMotor {
                    self.increase_motor_duty(self.motor_step)
                } else {
                    self.decrease_motor_duty(self.motor_step)
                };
                match result {
                    Ok(_) => tracing::info!("Motor now {:.0}%", self.duty_cycle_percentage()),
                    Err(e) => tracing::warn!("Motor adjustment failed: {}", e),
                }
            }
        }
    }
}

/// One snapshot for the periodic status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    pub temperature: Option<f64>,
    pub sensor_fault: bool,
    pub setpoint: f64,
    pub heater_output: f64,
    pub heater_on: bool,
    pub heater_on_time: Duration,
    pub motor_percentage: f64,
    pub motor_running: bool,
}

/// The running daemon. Workers are declared first so dropping a partially
/// built or running instance stops the loops before their devices go away.
pub struct SousVide {
    pid_worker: Worker,
    heater_worker: Worker,
    buttons_worker: Worker,
    pid_updates: Sender<PidUpdate>,
    controls: Controls,
    heater: HeaterTelemetry,
    motor: SharedMotor,
    sensor: Arc<Max31865>,
    table: Arc<CalibrationTable>,
}

impl SousVide {
    /// Bring everything up in acquisition order: calibration table, sensor,
    /// motor, controller, heater, buttons. On failure everything acquired so
    /// far is released in reverse order before the error is returned.
    pub fn start(
        config: &Config,
        board: &mut dyn Board,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SousVideError> {
        config.validate()?;

        let started = Instant::now();
        let table = Arc::new(CalibrationTable::build(&config.calibration.parameters())?);
        tracing::info!(
            "Calibration table: {} entries for {:.1}..{:.1} °C in {} ms",
            table.len(),
            table.min_temp(),
            table.max_temp(),
            started.elapsed().as_millis()
        );

        let bus = board.sensor_bus()?;
        let acquisition = match board.data_ready()? {
            Some(ready) => AcquisitionMode::DataReady(ready),
            None => AcquisitionMode::TimedPoll,
        };
        let sensor = Arc::new(Max31865::new(
            bus,
            acquisition,
            config.sensor_configuration(),
            table.clone(),
            clock.clone(),
        )?);

        // Seed the controller from a real conversion, not the empty cache
        let first = sensor.wait_for_reading(FIRST_READING_TIMEOUT)?;
        tracing::info!("First reading: {:.2} °C (code {})", first.celsius, first.code);

        let motor_config = &config.motor;
        let mut motor = Motor::new(board.motor_pwm()?, motor_config.duty_cycle_range)?;
        motor.set_duty_cycle(motor_config.initial_duty_cycle)?;
        if motor_config.start_on_launch {
            motor.start()?;
        }
        let motor: SharedMotor = Arc::new(Mutex::new(motor));

        let input_sensor = sensor.clone();
        let input = move || -> Result<f64, ControlError> {
            let reading = input_sensor.read_temperature()?;
            if reading.fault {
                let status = input_sensor.fault_status()?;
                return Err(ControlError::SensorFault(status));
            }
            Ok(reading.celsius)
        };
        let pid = PidController::new(config.pid.settings(), Box::new(input), clock.clone())?;
        let setpoint = pid.setpoint_handle();
        let output = pid.output_handle();
        let (pid_updates, updates) = mpsc::channel();
        let pid_worker = spawn("pid", move |stop| pid.run(stop, updates))?;

        let heater = HeaterActuator::new(
            board.heater_relay()?,
            config.heater.settings(),
            output.clone(),
            clock.clone(),
        )?;
        let telemetry = heater.telemetry();
        let heater_worker = spawn("heater", move |stop| heater.run(stop))?;

        let controls = Controls {
            setpoint,
            setpoint_min: config.pid.setpoint_min,
            setpoint_max: config.pid.setpoint_max,
            setpoint_step: config.pid.setpoint_step,
            heater_output: output,
            motor: motor.clone(),
            motor_step: config.motor.duty_cycle_step,
            sensor: sensor.clone(),
        };
        let panel = ButtonPanel::new(
            board.buttons()?,
            Duration::from_millis(config.buttons.debounce_ms),
            Duration::from_millis(config.buttons.poll_interval_ms),
            clock,
        );
        let button_controls = controls.clone();
        let buttons_worker = spawn("buttons", move |stop| {
            panel.run(stop, |action| button_controls.handle(action))
        })?;

        tracing::info!("Sous vide running, setpoint {:.1} °C", controls.setpoint());
        Ok(Self {
            pid_worker,
            heater_worker,
            buttons_worker,
            pid_updates,
            controls,
            heater: telemetry,
            motor,
            sensor,
            table,
        })
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn sensor(&self) -> &Max31865 {
        &self.sensor
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    pub fn heater_telemetry(&self) -> &HeaterTelemetry {
        &self.heater
    }

    /// Queue a re-tuning request for the controller loop.
    pub fn update_pid(&self, update: PidUpdate) -> Result<(), SousVideError> {
        self.pid_updates
            .send(update)
            .map_err(|_| SousVideError::ControllerStopped)
    }

    pub fn status(&self) -> Status {
        let (temperature, sensor_fault) = match self.controls.current_temperature() {
            Ok(reading) => (Some(reading.celsius), reading.fault),
            Err(e) => {
                tracing::warn!("Status read failed: {}", e);
                (None, false)
            }
        };
        let motor = lock_motor(&self.motor);
        Status {
            temperature,
            sensor_fault,
            setpoint: self.controls.setpoint(),
            heater_output: self.controls.heater_output(),
            heater_on: self.heater.relay_on(),
            heater_on_time: self.heater.total_on_time(),
            motor_percentage: motor.percentage() * 100.0,
            motor_running: motor.is_running(),
        }
    }

    /// Stop the loops (controller, heater, buttons) and then release the
    /// motor and the sensor. Every step runs even if an earlier one failed;
    /// the first error is returned.
    pub fn shutdown(mut self) -> Result<(), SousVideError> {
        tracing::info!("Shutting down");
        self.pid_worker.stop_and_join();
        self.heater_worker.stop_and_join();
        self.buttons_worker.stop_and_join();

        let motor = lock_motor(&self.motor).shutdown();
        if let Err(e) = &motor {
            tracing::error!("Motor shutdown failed: {}", e);
        }
        let sensor = self.sensor.shutdown();
        if let Err(e) = &sensor {
            tracing::error!("Sensor shutdown failed: {}", e);
        }
        motor?;
        sensor?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
