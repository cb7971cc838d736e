//! Stirring motor duty-cycle sink.
//!
//! The duty cycle is an integer in `0..=range`. Hardware writes only happen
//! while the motor runs; a stopped motor keeps the requested values and
//! applies them on [`Motor::start`].

use super::ControlError;
use crate::hardware::PwmOutput;

/// Smallest range that still leaves a usable resolution.
pub const MIN_RANGE: u32 = 10;

#[derive(Debug)]
pub struct Motor<P: PwmOutput> {
    pwm: P,
    duty_cycle: u32,
    range: u32,
    running: bool,
    range_pending: bool,
    released: bool,
}

fn check_range(range: u32) -> Result<(), ControlError> {
    if range > MIN_RANGE {
        Ok(())
    } else {
        Err(ControlError::InvalidRange(range))
    }
}

impl<P: PwmOutput> Motor<P> {
    /// Take over the PWM channel, stopped, with a zero duty cycle.
    pub fn new(mut pwm: P, range: u32) -> Result<Self, ControlError> {
        check_range(range)?;
        pwm.set_enabled(false)?;
        pwm.set_range(range)?;
        pwm.set_data(0)?;
        Ok(Self {
            pwm,
            duty_cycle: 0,
            range,
            running: false,
            range_pending: false,
            released: false,
        })
    }

    pub fn duty_cycle(&self) -> u32 {
        self.duty_cycle
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    /// Duty cycle as a fraction of the range.
    pub fn percentage(&self) -> f64 {
        f64::from(self.duty_cycle) / f64::from(self.range)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Set the duty cycle, clamped to the range.
    pub fn set_duty_cycle(&mut self, duty_cycle: u32) -> Result<u32, ControlError> {
        let duty_cycle = duty_cycle.min(self.range);
        if self.running && duty_cycle != self.duty_cycle {
            self.pwm.set_data(duty_cycle)?;
        }
        self.duty_cycle = duty_cycle;
        Ok(duty_cycle)
    }

    pub fn increase_duty_cycle(&mut self, step: u32) -> Result<u32, ControlError> {
        self.set_duty_cycle(self.duty_cycle.saturating_add(step))
    }

    pub fn decrease_duty_cycle(&mut self, step: u32) -> Result<u32, ControlError> {
        self.set_duty_cycle(self.duty_cycle.saturating_sub(step))
    }

    /// Change the range while keeping the duty percentage.
    ///
    /// A running motor gets the new values right away, ordered so the data
    /// register never exceeds the range register: a shrinking range writes
    /// the data first, a growing one the range first. On a stopped motor the
    /// range write waits for [`Motor::start`].
    pub fn set_range(&mut self, range: u32) -> Result<(), ControlError> {
        check_range(range)?;
        if range == self.range {
            return Ok(());
        }
        let scaled = (self.percentage() * f64::from(range)).round() as u32;
        let duty_cycle = scaled.min(range);
        let shrinking = range < self.range;

        if self.running {
            if shrinking {
                self.pwm.set_data(duty_cycle)?;
                self.pwm.set_range(range)?;
            } else {
                self.pwm.set_range(range)?;
                self.pwm.set_data(duty_cycle)?;
            }
        } else {
            self.range_pending = true;
        }
        tracing::debug!(
            "Motor range {} -> {}, duty {} -> {}",
            self.range,
            range,
            self.duty_cycle,
            duty_cycle
        );
        self.range = range;
        self.duty_cycle = duty_cycle;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), ControlError> {
        if self.running {
            return Ok(());
        }
        if self.range_pending {
            self.pwm.set_range(self.range)?;
            self.range_pending = false;
        }
        self.pwm.set_data(self.duty_cycle)?;
        self.pwm.set_enabled(true)?;
        self.running = true;
        tracing::info!("Motor started at {:.0}%", self.percentage() * 100.0);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ControlError> {
        if !self.running {
            return Ok(());
        }
        self.pwm.set_enabled(false)?;
        self.running = false;
        tracing::info!("Motor stopped");
        Ok(())
    }

    /// Zero the duty cycle, disable the output and release the pin.
    /// Idempotent.
    pub fn shutdown(&mut self) -> Result<(), ControlError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.running = false;
        self.duty_cycle = 0;
        let data = self.pwm.set_data(0);
        let enabled = self.pwm.set_enabled(false);
        let released = self.pwm.release();
        data?;
        enabled?;
        released?;
        Ok(())
    }
}

impl<P: PwmOutput> Drop for Motor<P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Motor shutdown failed: {}", e);
        }
    }
}
