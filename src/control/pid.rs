//! Discrete-time PID controller for the bath temperature.
//!
//! Derivative on measurement (a setpoint step does not kick the output) and
//! integral anti-windup by clamping the integrator to the output limits.
//!
//! The integral gain is stored pre-multiplied and the derivative gain
//! pre-divided by the sampling interval, so the update law itself never
//! looks at time:
//!
//! ```text
//! error    = setpoint - input
//! integral = clamp(integral + ki * error)
//! output   = clamp(kp * error + integral - kd * (input - last_input))
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::ControlError;
use crate::scheduler::{Clock, StopSignal};

/// An `f64` written by one thread and read by others without a lock.
#[derive(Debug, Clone)]
pub struct SharedValue(Arc<AtomicU64>);

impl SharedValue {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Where the controller gets its process variable from.
pub trait InputSource: Send {
    fn sample(&mut self) -> Result<f64, ControlError>;
}

impl<F> InputSource for F
where
    F: FnMut() -> Result<f64, ControlError> + Send,
{
    fn sample(&mut self) -> Result<f64, ControlError> {
        self()
    }
}

/// Gains as configured, in per-second units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSettings {
    pub setpoint: f64,
    pub gains: PidGains,
    pub interval: Duration,
    pub output_min: f64,
    pub output_max: f64,
}

/// Re-tuning requests delivered to a running controller loop. Each one is
/// applied before the next evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidUpdate {
    Gains(PidGains),
    Limits { min: f64, max: f64 },
    Interval(Duration),
}

pub struct PidController {
    setpoint: SharedValue,
    gains: PidGains,
    kp: f64,
    ki: f64,
    kd: f64,

    integral: f64,
    last_input: f64,
    output: f64,
    output_min: f64,
    output_max: f64,

    input: Box<dyn InputSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_evaluation: Instant,
    published: SharedValue,
}

fn check_setpoint(setpoint: f64) -> Result<(), ControlError> {
    if !setpoint.is_finite() {
        return Err(ControlError::NonFiniteSetpoint(setpoint));
    }
    if setpoint < 0.0 {
        return Err(ControlError::NegativeSetpoint(setpoint));
    }
    Ok(())
}

fn check_gains(gains: &PidGains) -> Result<(), ControlError> {
    if [gains.kp, gains.ki, gains.kd].iter().all(|g| g.is_finite()) {
        Ok(())
    } else {
        Err(ControlError::NonFiniteGains(*gains))
    }
}

fn check_limits(min: f64, max: f64) -> Result<(), ControlError> {
    if min < max {
        Ok(())
    } else {
        Err(ControlError::InvalidLimits { min, max })
    }
}

impl PidController {
    /// Create a controller. The input is sampled once to seed the derivative
    /// history; the first evaluation happens one interval later.
    pub fn new(
        settings: PidSettings,
        mut input: Box<dyn InputSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ControlError> {
        if settings.interval.is_zero() {
            return Err(ControlError::ZeroInterval);
        }
        check_limits(settings.output_min, settings.output_max)?;
        check_setpoint(settings.setpoint)?;
        check_gains(&settings.gains)?;

        let last_input = input.sample()?;
        if !last_input.is_finite() {
            return Err(ControlError::NonFiniteInput(last_input));
        }
        let initial_output = 0.0_f64.clamp(settings.output_min, settings.output_max);
        let mut pid = Self {
            setpoint: SharedValue::new(settings.setpoint),
            gains: settings.gains,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            integral: initial_output,
            last_input,
            output: initial_output,
            output_min: settings.output_min,
            output_max: settings.output_max,
            input,
            last_evaluation: clock.now(),
            clock,
            interval: settings.interval,
            published: SharedValue::new(initial_output),
        };
        pid.scale_gains();
        Ok(pid)
    }

    fn scale_gains(&mut self) {
        let dt = self.interval.as_secs_f64();
        self.kp = self.gains.kp;
        self.ki = self.gains.ki * dt;
        self.kd = self.gains.kd / dt;
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.output_min, self.output_max)
    }

    /// Handle for lock-free setpoint changes from other threads.
    pub fn setpoint_handle(&self) -> SharedValue {
        self.setpoint.clone()
    }

    /// Handle through which every new output is published.
    pub fn output_handle(&self) -> SharedValue {
        self.published.clone()
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint.load()
    }

    pub fn set_setpoint(&mut self, setpoint: f64) -> Result<(), ControlError> {
        check_setpoint(setpoint)?;
        self.setpoint.store(setpoint);
        Ok(())
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) -> Result<(), ControlError> {
        check_gains(&gains)?;
        self.gains = gains;
        self.scale_gains();
        tracing::info!(
            "PID retuned: Kp={:.3}, Ki={:.3}, Kd={:.3}",
            gains.kp,
            gains.ki,
            gains.kd
        );
        Ok(())
    }

    pub fn limits(&self) -> (f64, f64) {
        (self.output_min, self.output_max)
    }

    /// Change the output limits. Integral and output are re-clamped right
    /// away so stale state never exceeds the new bounds.
    pub fn set_limits(&mut self, min: f64, max: f64) -> Result<(), ControlError> {
        check_limits(min, max)?;
        self.output_min = min;
        self.output_max = max;
        self.integral = self.clamp(self.integral);
        self.output = self.clamp(self.output);
        self.published.store(self.output);
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the sampling interval and rescale the stored gains.
    pub fn set_interval(&mut self, interval: Duration) -> Result<(), ControlError> {
        if interval.is_zero() {
            return Err(ControlError::ZeroInterval);
        }
        self.interval = interval;
        self.scale_gains();
        Ok(())
    }

    pub fn apply(&mut self, update: PidUpdate) -> Result<(), ControlError> {
        match update {
            PidUpdate::Gains(gains) => self.set_gains(gains),
            PidUpdate::Limits { min, max } => self.set_limits(min, max),
            PidUpdate::Interval(interval) => self.set_interval(interval),
        }
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Run one control step if a full interval has passed since the last
    /// one; otherwise return the cached output untouched.
    ///
    /// A non-finite input or setpoint is an input error and leaves the
    /// controller state as it was.
    pub fn evaluate(&mut self) -> Result<f64, ControlError> {
        let now = self.clock.now();
        if now.saturating_duration_since(self.last_evaluation) < self.interval {
            return Ok(self.output);
        }
        self.last_evaluation = now;

        let input = self.input.sample()?;
        if !input.is_finite() {
            return Err(ControlError::NonFiniteInput(input));
        }
        let setpoint = self.setpoint.load();
        check_setpoint(setpoint)?;
        let error = setpoint - input;
        let delta_input = input - self.last_input;

        let integral = self.clamp(self.integral + self.ki * error);
        let output = self.clamp(self.kp * error + integral - self.kd * delta_input);
        if !output.is_finite() || !integral.is_finite() {
            return Err(ControlError::NonFiniteInput(input));
        }
        self.integral = integral;
        self.last_input = input;
        self.output = output;
        self.published.store(self.output);

        tracing::debug!(
            "PID: input={:.2} setpoint={:.2} integral={:.3} output={:.3}",
            input,
            self.setpoint.load(),
            self.integral,
            self.output
        );
        Ok(self.output)
    }

    /// Time left until the next evaluation is due.
    pub fn time_until_next(&self) -> Duration {
        let elapsed = self.clock.now().saturating_duration_since(self.last_evaluation);
        self.interval.saturating_sub(elapsed)
    }

    /// Drive the output to its minimum (heater off) after an input failure.
    pub fn fail_safe(&mut self) {
        self.output = self.output_min;
        self.published.store(self.output);
    }

    /// Periodic evaluation loop. Returns once `stop` is raised.
    pub fn run(mut self, stop: StopSignal, updates: Receiver<PidUpdate>) {
        tracing::info!(
            "PID loop started (interval {} ms, setpoint {:.1} °C)",
            self.interval.as_millis(),
            self.setpoint()
        );
        while !stop.is_stopped() {
            for update in updates.try_iter() {
                if let Err(e) = self.apply(update) {
                    tracing::warn!("Rejected PID update {:?}: {}", update, e);
                }
            }

            if let Err(e) = self.evaluate() {
                tracing::error!("PID input failed, heater output forced to minimum: {}", e);
                self.fail_safe();
            }

            let wait = self.time_until_next();
            self.clock.sleep(wait);
        }
        tracing::info!("PID loop stopped");
    }
}

impl fmt::Debug for PidController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidController")
            .field("setpoint", &self.setpoint.load())
            .field("gains", &self.gains)
            .field("integral", &self.integral)
            .field("last_input", &self.last_input)
            .field("output", &self.output)
            .field("output_min", &self.output_min)
            .field("output_max", &self.output_max)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
