//! Time-proportioning heater actuator.
//!
//! The PID output is read as a duty fraction and turned into an on/off
//! budget per control period. The relay is a zero-crossing SSR, so the
//! on-time is rounded up to whole mains half-cycles and anything shorter
//! than one half-cycle is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::pid::SharedValue;
use super::ControlError;
use crate::hardware::{HardwareError, Relay};
use crate::scheduler::{Clock, StopSignal};

/// Tolerance, in half-cycles, for float noise on exact multiples.
const HALF_CYCLE_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaterSettings {
    /// Length of one on/off cycle.
    pub period: Duration,
    /// Mains half-cycle, the switching granularity of the SSR.
    pub half_cycle: Duration,
}

impl HeaterSettings {
    pub fn new(period: Duration, mains_frequency_hz: f64) -> Self {
        Self {
            period,
            half_cycle: Duration::from_nanos((1e9 / (2.0 * mains_frequency_hz)).round() as u64),
        }
    }

    /// Split one period into on and off time for `duty`.
    pub fn budget(&self, duty: f64) -> DutyBudget {
        let on = on_interval(duty, self.period, self.half_cycle);
        DutyBudget {
            on,
            off: self.period.saturating_sub(on),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyBudget {
    pub on: Duration,
    pub off: Duration,
}

/// On-time for `duty` within `period`, rounded up to whole half-cycles.
///
/// Returns zero when `duty * period` is shorter than one half-cycle and never
/// more than `period`. `duty` is clamped to `[0, 1]`; NaN counts as zero.
pub fn on_interval(duty: f64, period: Duration, half_cycle: Duration) -> Duration {
    let duty = if duty.is_nan() { 0.0 } else { duty.clamp(0.0, 1.0) };
    let half_ns = half_cycle.as_nanos() as u64;
    if half_ns == 0 {
        return Duration::ZERO;
    }
    let cycles = duty * period.as_nanos() as f64 / half_ns as f64;
    if cycles < 1.0 - HALF_CYCLE_EPSILON {
        return Duration::ZERO;
    }
    let cycles = (cycles - HALF_CYCLE_EPSILON).ceil() as u64;
    Duration::from_nanos(cycles.saturating_mul(half_ns)).min(period)
}

/// Counters other threads can read while the actuator runs.
#[derive(Debug, Clone, Default)]
pub struct HeaterTelemetry {
    relay_on: Arc<AtomicBool>,
    on_time_us: Arc<AtomicU64>,
    last_on_us: Arc<AtomicU64>,
    periods: Arc<AtomicU64>,
}

impl HeaterTelemetry {
    pub fn relay_on(&self) -> bool {
        self.relay_on.load(Ordering::Acquire)
    }

    /// Accumulated relay on-time since startup.
    pub fn total_on_time(&self) -> Duration {
        Duration::from_micros(self.on_time_us.load(Ordering::Acquire))
    }

    /// On-time budgeted for the most recent period.
    pub fn last_on_time(&self) -> Duration {
        Duration::from_micros(self.last_on_us.load(Ordering::Acquire))
    }

    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Acquire)
    }

    fn record(&self, budget: &DutyBudget) {
        let on_us = budget.on.as_micros() as u64;
        self.on_time_us.fetch_add(on_us, Ordering::AcqRel);
        self.last_on_us.store(on_us, Ordering::Release);
        self.periods.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct HeaterActuator<R: Relay> {
    relay: R,
    relay_on: bool,
    settings: HeaterSettings,
    output: SharedValue,
    clock: Arc<dyn Clock>,
    telemetry: HeaterTelemetry,
}

impl<R: Relay> HeaterActuator<R> {
    /// Take over the relay. It is switched off once so the tracked state is
    /// known to match the pin.
    pub fn new(
        mut relay: R,
        settings: HeaterSettings,
        output: SharedValue,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ControlError> {
        relay.set(false)?;
        Ok(Self {
            relay,
            relay_on: false,
            settings,
            output,
            clock,
            telemetry: HeaterTelemetry::default(),
        })
    }

    pub fn settings(&self) -> HeaterSettings {
        self.settings
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn telemetry(&self) -> HeaterTelemetry {
        self.telemetry.clone()
    }

    /// Drive the relay to `on` and return how long the write took. A write
    /// to a relay already in that state is skipped.
    fn switch(&mut self, on: bool) -> Result<Duration, HardwareError> {
        if self.relay_on == on {
            return Ok(Duration::ZERO);
        }
        let start = self.clock.now();
        self.relay.set(on)?;
        self.relay_on = on;
        self.telemetry.relay_on.store(on, Ordering::Release);
        Ok(self.clock.now().saturating_duration_since(start))
    }

    /// Run one full period against the currently published output.
    pub fn run_period(&mut self) -> Result<DutyBudget, HardwareError> {
        let duty = self.output.load();
        let budget = self.settings.budget(duty);

        if !budget.on.is_zero() {
            let latency = self.switch(true)?;
            self.clock.sleep(budget.on.saturating_sub(latency));
        }
        if !budget.off.is_zero() {
            let latency = self.switch(false)?;
            self.clock.sleep(budget.off.saturating_sub(latency));
        }

        self.telemetry.record(&budget);
        tracing::trace!(
            "Heater period: duty={:.3} on={} ms off={} ms",
            duty,
            budget.on.as_millis(),
            budget.off.as_millis()
        );
        Ok(budget)
    }

    /// Force the relay off regardless of the tracked state.
    pub fn shutdown(&mut self) -> Result<(), HardwareError> {
        self.relay.set(false)?;
        self.relay_on = false;
        self.telemetry.relay_on.store(false, Ordering::Release);
        Ok(())
    }

    /// Period loop. Returns once `stop` is raised, leaving the relay off.
    pub fn run(mut self, stop: StopSignal) {
        tracing::info!(
            "Heater loop started (period {} ms, half-cycle {:.2} ms)",
            self.settings.period.as_millis(),
            self.settings.half_cycle.as_secs_f64() * 1000.0
        );
        while !stop.is_stopped() {
            if let Err(e) = self.run_period() {
                tracing::error!("Heater relay write failed: {}", e);
                if let Err(e) = self.shutdown() {
                    tracing::error!("Could not force heater relay off: {}", e);
                }
                self.clock.sleep(self.settings.period);
            }
        }
        if let Err(e) = self.shutdown() {
            tracing::error!("Could not force heater relay off: {}", e);
        }
        tracing::info!(
            "Heater loop stopped ({} s total on-time)",
            self.telemetry.total_on_time().as_secs()
        );
    }
}
