//! MAX31865 RTD-to-digital converter.
//!
//! This module handles SPI framing and register access for the MAX31865 and
//! turns RTD readings into temperatures through a [`CalibrationTable`].
//!
//! Frames are MSB-first. A read sends the register address with bit 7 clear
//! followed by don't-care bytes and gets the value back in the trailing bytes;
//! a write sends `address | 0x80` followed by the payload.
//!
//! The driver is shared between threads (control loop, status reporting).
//! Every register transaction plus the cached state it updates runs under a
//! single mutex, so callers never see a torn RTD word or a data-ready latch
//! that was cleared by someone else halfway through a read.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{HardwareError, ReadySignal, RegisterBus};
use crate::calibration::CalibrationTable;
use crate::scheduler::Clock;

// Register addresses
pub mod reg {
    pub const CONFIG: u8 = 0x00;
    pub const RTD_MSB: u8 = 0x01;
    pub const RTD_LSB: u8 = 0x02;
    pub const FAULT_HT_MSB: u8 = 0x03;
    pub const FAULT_HT_LSB: u8 = 0x04;
    pub const FAULT_LT_MSB: u8 = 0x05;
    pub const FAULT_LT_LSB: u8 = 0x06;
    pub const FAULT_STATUS: u8 = 0x07;
}

const WRITE_BIT: u8 = 0x80;

// Configuration register bits
const CFG_BIAS: u8 = 1 << 7;
const CFG_CONTINUOUS: u8 = 1 << 6;
const CFG_ONE_SHOT: u8 = 1 << 5;
const CFG_THREE_WIRE: u8 = 1 << 4;
const CFG_FAULT_CYCLE_SHIFT: u8 = 2;
const CFG_FAULT_CYCLE_MASK: u8 = 0b11 << CFG_FAULT_CYCLE_SHIFT;
const CFG_FAULT_CLEAR: u8 = 1 << 1;
const CFG_FILTER_60HZ: u8 = 1 << 0;

/// Bits the chip resets on its own once the requested action completed.
const SELF_CLEARING_BITS: u8 = CFG_ONE_SHOT | CFG_FAULT_CYCLE_MASK | CFG_FAULT_CLEAR;

/// One conversion in continuous mode with the 50 Hz filter.
pub const CONVERSION_PERIOD: Duration = Duration::from_millis(50);

const FIRST_READING_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Invalid configuration: one-shot and continuous conversion are mutually exclusive")]
    ConflictingConversionModes,
    #[error("Configuration read-back mismatch: wrote {expected:#04x}, read {actual:#04x}")]
    Verification { expected: u8, actual: u8 },
    #[error("Sensor disabled after a verification failure")]
    Disabled,
    #[error("Sensor already shut down")]
    Closed,
    #[error("No conversion completed within {0:?}")]
    NoConversion(Duration),
    #[error("Sensor state lock poisoned")]
    Poisoned,
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
}

/// Conversion mode, config bit 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    NormallyOff,
    Continuous,
}

/// RTD wiring. Two- and four-wire share the same (cleared) config bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Wiring {
    TwoWire,
    ThreeWire,
    FourWire,
}

/// Fault-detection cycle control, config bits 3–2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCycle {
    /// No action.
    Idle = 0b00,
    /// Automatic delay fault detection.
    Automatic = 0b01,
    /// Manual cycle, first step.
    ManualStart = 0b10,
    /// Manual cycle, finishing step.
    ManualFinish = 0b11,
}

/// Mains noise-rejection filter, config bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseFilter {
    Hz50,
    Hz60,
}

/// Decoded contents of the configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    pub bias: bool,
    pub conversion: ConversionMode,
    pub one_shot: bool,
    pub wiring: Wiring,
    pub fault_cycle: FaultCycle,
    pub fault_auto_clear: bool,
    pub filter: NoiseFilter,
}

impl SensorConfig {
    /// Bias on, continuous conversion, fault status auto-clear.
    pub fn continuous(wiring: Wiring, filter: NoiseFilter) -> Self {
        Self {
            bias: true,
            conversion: ConversionMode::Continuous,
            one_shot: false,
            wiring,
            fault_cycle: FaultCycle::Idle,
            fault_auto_clear: true,
            filter,
        }
    }

    /// Bias off, no conversions.
    pub fn disabled(wiring: Wiring, filter: NoiseFilter) -> Self {
        Self {
            bias: false,
            conversion: ConversionMode::NormallyOff,
            one_shot: false,
            wiring,
            fault_cycle: FaultCycle::Idle,
            fault_auto_clear: true,
            filter,
        }
    }

    /// Encode into the register byte.
    pub fn to_bits(&self) -> Result<u8, SensorError> {
        if self.one_shot && self.conversion == ConversionMode::Continuous {
            return Err(SensorError::ConflictingConversionModes);
        }

        let mut bits = match self.filter {
            NoiseFilter::Hz50 => 0,
            NoiseFilter::Hz60 => CFG_FILTER_60HZ,
        };
        if self.fault_auto_clear {
            bits |= CFG_FAULT_CLEAR;
        }
        bits |= (self.fault_cycle as u8) << CFG_FAULT_CYCLE_SHIFT;
        if self.wiring == Wiring::ThreeWire {
            bits |= CFG_THREE_WIRE;
        }
        if self.one_shot {
            bits |= CFG_ONE_SHOT;
        }
        if self.conversion == ConversionMode::Continuous {
            bits |= CFG_CONTINUOUS;
        }
        if self.bias {
            bits |= CFG_BIAS;
        }
        Ok(bits)
    }
}

/// Fault status register (0x07).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultStatus {
    raw: u8,
}

impl FaultStatus {
    pub fn from_raw(raw: u8) -> Self {
        Self { raw }
    }

    #[inline]
    pub fn raw(&self) -> u8 {
        self.raw
    }

    /// No fault flagged.
    #[inline]
    pub fn is_clear(&self) -> bool {
        self.raw & 0xFC == 0
    }

    /// RTD above the high fault threshold.
    #[inline]
    pub fn rtd_high_threshold(&self) -> bool {
        (self.raw & (1 << 7)) != 0
    }

    /// RTD below the low fault threshold.
    #[inline]
    pub fn rtd_low_threshold(&self) -> bool {
        (self.raw & (1 << 6)) != 0
    }

    /// REFIN- > 0.85 x VBIAS.
    #[inline]
    pub fn refin_high(&self) -> bool {
        (self.raw & (1 << 5)) != 0
    }

    /// REFIN- < 0.85 x VBIAS, FORCE- open.
    #[inline]
    pub fn refin_low(&self) -> bool {
        (self.raw & (1 << 4)) != 0
    }

    /// RTDIN- < 0.85 x VBIAS, FORCE- open.
    #[inline]
    pub fn rtdin_low(&self) -> bool {
        (self.raw & (1 << 3)) != 0
    }

    /// Over- or undervoltage on an input.
    #[inline]
    pub fn overvoltage(&self) -> bool {
        (self.raw & (1 << 2)) != 0
    }
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.rtd_high_threshold() {
            names.push("rtd-high");
        }
        if self.rtd_low_threshold() {
            names.push("rtd-low");
        }
        if self.refin_high() {
            names.push("refin-high");
        }
        if self.refin_low() {
            names.push("refin-low");
        }
        if self.rtdin_low() {
            names.push("rtdin-low");
        }
        if self.overvoltage() {
            names.push("overvoltage");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// High/low RTD fault thresholds, raw register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultThresholds {
    pub high: u16,
    pub low: u16,
}

impl FaultThresholds {
    fn from_word(word: u32) -> Self {
        Self {
            high: (word >> 16) as u16,
            low: (word & 0xFFFF) as u16,
        }
    }

    fn to_word(self) -> u32 {
        (u32::from(self.high) << 16) | u32::from(self.low)
    }
}

/// How new conversions are detected.
pub enum AcquisitionMode {
    /// Watch the DRDY line; read only after it latched.
    DataReady(Box<dyn ReadySignal>),
    /// No DRDY line wired: read at most once per conversion period.
    TimedPoll,
}

impl fmt::Debug for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMode::DataReady(_) => write!(f, "DataReady"),
            AcquisitionMode::TimedPoll => write!(f, "TimedPoll"),
        }
    }
}

/// Raw RTD acquisition result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtdReading {
    /// 15-bit RTD code.
    pub code: u16,
    /// Fault bit of a fresh reading. Always false for a cached one.
    pub fault: bool,
    /// Whether the code came from a new conversion.
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub code: u16,
    pub fault: bool,
}

#[derive(Debug)]
struct SensorState {
    config: u8,
    rtd: u16,
    thresholds: FaultThresholds,
    last_poll: Option<Instant>,
    disabled: bool,
    closed: bool,
}

struct Inner {
    bus: Box<dyn RegisterBus>,
    acquisition: AcquisitionMode,
    state: SensorState,
}

fn read_register8(bus: &mut dyn RegisterBus, reg: u8) -> Result<u8, HardwareError> {
    let mut frame = [reg & !WRITE_BIT, 0];
    bus.transfer(&mut frame)?;
    Ok(frame[1])
}

fn read_register16(bus: &mut dyn RegisterBus, reg: u8) -> Result<u16, HardwareError> {
    let mut frame = [reg & !WRITE_BIT, 0, 0];
    bus.transfer(&mut frame)?;
    Ok(u16::from_be_bytes([frame[1], frame[2]]))
}

fn read_register32(bus: &mut dyn RegisterBus, reg: u8) -> Result<u32, HardwareError> {
    let mut frame = [reg & !WRITE_BIT, 0, 0, 0, 0];
    bus.transfer(&mut frame)?;
    Ok(u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]))
}

fn write_register8(bus: &mut dyn RegisterBus, reg: u8, value: u8) -> Result<(), HardwareError> {
    let mut frame = [reg | WRITE_BIT, value];
    bus.transfer(&mut frame)
}

fn write_register16(bus: &mut dyn RegisterBus, reg: u8, value: u16) -> Result<(), HardwareError> {
    let [hi, lo] = value.to_be_bytes();
    let mut frame = [reg | WRITE_BIT, hi, lo];
    bus.transfer(&mut frame)
}

fn write_register32(bus: &mut dyn RegisterBus, reg: u8, value: u32) -> Result<(), HardwareError> {
    let [b3, b2, b1, b0] = value.to_be_bytes();
    let mut frame = [reg | WRITE_BIT, b3, b2, b1, b0];
    bus.transfer(&mut frame)
}

impl Inner {
    fn usable(&self) -> Result<(), SensorError> {
        if self.state.closed {
            Err(SensorError::Closed)
        } else if self.state.disabled {
            Err(SensorError::Disabled)
        } else {
            Ok(())
        }
    }

    fn apply_configuration(&mut self, config: &SensorConfig) -> Result<(), SensorError> {
        let bits = config.to_bits()?;
        write_register8(self.bus.as_mut(), reg::CONFIG, bits)?;

        let expected = bits & !SELF_CLEARING_BITS;
        let actual = read_register8(self.bus.as_mut(), reg::CONFIG)? & !SELF_CLEARING_BITS;
        if actual != expected {
            tracing::error!(
                "MAX31865 config verification failed (wrote {:#04x}, read {:#04x}), disabling sensor",
                bits,
                actual
            );
            self.state.disabled = true;
            if let Err(e) = write_register8(self.bus.as_mut(), reg::CONFIG, 0) {
                tracing::warn!("Failed to put MAX31865 into a disabled state: {}", e);
            }
            return Err(SensorError::Verification { expected, actual });
        }

        self.state.config = expected;
        Ok(())
    }

    fn acquire(&mut self, now: Instant) -> Result<RtdReading, SensorError> {
        let fresh = match &mut self.acquisition {
            AcquisitionMode::DataReady(ready) => ready.is_ready()?,
            AcquisitionMode::TimedPoll => self
                .state
                .last_poll
                .is_none_or(|last| now.saturating_duration_since(last) >= CONVERSION_PERIOD),
        };

        if !fresh {
            return Ok(RtdReading {
                code: self.state.rtd,
                fault: false,
                fresh: false,
            });
        }

        let word = read_register16(self.bus.as_mut(), reg::RTD_MSB)?;
        let fault = word & 0x0001 != 0;
        self.state.rtd = (word >> 1) & 0x7FFF;

        match &mut self.acquisition {
            AcquisitionMode::DataReady(ready) => ready.clear()?,
            AcquisitionMode::TimedPoll => self.state.last_poll = Some(now),
        }

        Ok(RtdReading {
            code: self.state.rtd,
            fault,
            fresh: true,
        })
    }

    fn teardown(&mut self, disabled_config: u8) -> Result<(), SensorError> {
        if self.state.closed {
            return Ok(());
        }
        self.state.closed = true;

        // Release everything even if one step fails; report the first error
        let mut first_error: Option<SensorError> = None;
        if let Err(e) = write_register8(self.bus.as_mut(), reg::CONFIG, disabled_config) {
            tracing::warn!("Failed to stop MAX31865 conversions: {}", e);
            first_error.get_or_insert(e.into());
        }
        if let AcquisitionMode::DataReady(ready) = &mut self.acquisition {
            if let Err(e) = ready.release() {
                tracing::warn!("Failed to release data-ready line: {}", e);
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.bus.release() {
            tracing::warn!("Failed to release SPI bus: {}", e);
            first_error.get_or_insert(e.into());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// MAX31865 driver bound to one chip select and one calibration table.
pub struct Max31865 {
    inner: Mutex<Inner>,
    table: Arc<CalibrationTable>,
    clock: Arc<dyn Clock>,
    wiring: Wiring,
    filter: NoiseFilter,
}

impl Max31865 {
    /// Bring the converter up: read the current fault thresholds, then write
    /// and verify `initial`. On failure the bus and data-ready line are
    /// released before the error is returned.
    pub fn new(
        bus: Box<dyn RegisterBus>,
        acquisition: AcquisitionMode,
        initial: SensorConfig,
        table: Arc<CalibrationTable>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SensorError> {
        let sensor = Self {
            inner: Mutex::new(Inner {
                bus,
                acquisition,
                state: SensorState {
                    config: 0,
                    rtd: 0,
                    thresholds: FaultThresholds::default(),
                    last_poll: None,
                    disabled: false,
                    closed: false,
                },
            }),
            table,
            clock,
            wiring: initial.wiring,
            filter: initial.filter,
        };

        let init = sensor
            .fault_thresholds()
            .and_then(|_| sensor.set_configuration(&initial));
        if let Err(e) = init {
            tracing::error!("MAX31865 initialization failed: {}", e);
            // Dropping runs the teardown
            drop(sensor);
            return Err(e);
        }

        {
            let inner = sensor.lock()?;
            tracing::info!(
                "MAX31865 ready (config {:#04x}, {:?} acquisition)",
                inner.state.config,
                inner.acquisition
            );
        }
        Ok(sensor)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, SensorError> {
        self.inner.lock().map_err(|_| SensorError::Poisoned)
    }

    /// Last configuration byte written, without the self-clearing bits.
    pub fn configuration(&self) -> Result<u8, SensorError> {
        Ok(self.lock()?.state.config)
    }

    /// Read the configuration register from the chip.
    pub fn read_configuration(&self) -> Result<u8, SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        let config = read_register8(inner.bus.as_mut(), reg::CONFIG)?;
        if config & !SELF_CLEARING_BITS != inner.state.config {
            tracing::warn!(
                "MAX31865 config register {:#04x} differs from cached {:#04x}",
                config,
                inner.state.config
            );
        }
        Ok(config)
    }

    /// Write and verify a new configuration. A conflicting request is
    /// rejected before anything goes out on the bus.
    pub fn set_configuration(&self, config: &SensorConfig) -> Result<(), SensorError> {
        config.to_bits()?;
        let mut inner = self.lock()?;
        inner.usable()?;
        inner.apply_configuration(config)
    }

    /// Latest RTD code. Fetches a new conversion when one is available and
    /// returns the cached code otherwise.
    pub fn read_rtd(&self) -> Result<RtdReading, SensorError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        inner.usable()?;
        inner.acquire(now)
    }

    /// Block until a fresh conversion arrives, polling on the driver's
    /// clock. Fails with [`SensorError::NoConversion`] after `timeout`.
    pub fn wait_for_reading(&self, timeout: Duration) -> Result<TemperatureReading, SensorError> {
        let deadline = self.clock.now() + timeout;
        loop {
            let reading = self.read_rtd()?;
            if reading.fresh {
                return Ok(self.temperature(&reading));
            }
            let now = self.clock.now();
            if now >= deadline {
                return Err(SensorError::NoConversion(timeout));
            }
            self.clock
                .sleep(FIRST_READING_POLL.min(deadline.saturating_duration_since(now)));
        }
    }

    /// Latest bath temperature.
    pub fn read_temperature(&self) -> Result<TemperatureReading, SensorError> {
        let reading = self.read_rtd()?;
        Ok(self.temperature(&reading))
    }

    fn temperature(&self, reading: &RtdReading) -> TemperatureReading {
        TemperatureReading {
            celsius: self.table.lookup(reading.code),
            code: reading.code,
            fault: reading.fault,
        }
    }

    /// Temperature for an arbitrary raw code.
    pub fn convert_code(&self, code: u16) -> f64 {
        self.table.lookup(code & 0x7FFF)
    }

    /// Read both fault thresholds in one 32-bit transfer.
    pub fn fault_thresholds(&self) -> Result<FaultThresholds, SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        let word = read_register32(inner.bus.as_mut(), reg::FAULT_HT_MSB)?;
        inner.state.thresholds = FaultThresholds::from_word(word);
        Ok(inner.state.thresholds)
    }

    /// Thresholds as last read or written, without bus traffic.
    pub fn cached_fault_thresholds(&self) -> Result<FaultThresholds, SensorError> {
        Ok(self.lock()?.state.thresholds)
    }

    /// Write both fault thresholds in one 32-bit transfer.
    pub fn set_fault_thresholds(&self, thresholds: FaultThresholds) -> Result<(), SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        write_register32(inner.bus.as_mut(), reg::FAULT_HT_MSB, thresholds.to_word())?;
        inner.state.thresholds = thresholds;
        Ok(())
    }

    pub fn set_fault_high_threshold(&self, high: u16) -> Result<(), SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        write_register16(inner.bus.as_mut(), reg::FAULT_HT_MSB, high)?;
        inner.state.thresholds.high = high;
        Ok(())
    }

    pub fn set_fault_low_threshold(&self, low: u16) -> Result<(), SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        write_register16(inner.bus.as_mut(), reg::FAULT_LT_MSB, low)?;
        inner.state.thresholds.low = low;
        Ok(())
    }

    pub fn fault_status(&self) -> Result<FaultStatus, SensorError> {
        let mut inner = self.lock()?;
        inner.usable()?;
        let raw = read_register8(inner.bus.as_mut(), reg::FAULT_STATUS)?;
        Ok(FaultStatus::from_raw(raw))
    }

    /// Stop conversions, release the data-ready line and idle the bus.
    /// Safe to call more than once.
    pub fn shutdown(&self) -> Result<(), SensorError> {
        let disabled = SensorConfig::disabled(self.wiring, self.filter).to_bits()?;
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            // Still release the hardware if a reader panicked mid-transfer
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = inner.teardown(disabled);
        tracing::info!("MAX31865 shut down");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|inner| inner.state.closed).unwrap_or(true)
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }
}

impl Drop for Max31865 {
    fn drop(&mut self) {
        let closed = match self.inner.get_mut() {
            Ok(inner) => inner.state.closed,
            Err(poisoned) => poisoned.get_ref().state.closed,
        };
        if !closed {
            if let Err(e) = self.shutdown() {
                tracing::warn!("MAX31865 teardown on drop failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for Max31865 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Max31865")
            .field("wiring", &self.wiring)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
