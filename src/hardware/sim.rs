// src/hardware/sim.rs - Simulated water bath
//
// A first-order thermal model of the bath plus fake devices wired into it:
// an emulated MAX31865 register file, the DRDY line, the heater relay, the
// motor PWM and four buttons. Used by `--simulate` and the integration tests.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::max31865::{reg, CONVERSION_PERIOD};
use super::{
    Board, ButtonInput, ButtonSet, HardwareError, PwmOutput, ReadySignal, RegisterBus, Relay,
};
use crate::calibration::{resistance_at, CODE_RANGE};
use crate::scheduler::Clock;

const CONFIG_BIAS: u8 = 0x80;
const CONFIG_CONTINUOUS: u8 = 0x40;
const CONFIG_ONE_SHOT: u8 = 0x20;
const CONFIG_FAULT_CYCLE: u8 = 0x0C;
const CONFIG_FAULT_CLEAR: u8 = 0x02;
const REGISTER_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BathParameters {
    pub r0: f64,
    pub reference_resistance: f64,
    pub ambient: f64,
    pub initial_temperature: f64,
    /// Temperature rise per second with the heater fully on, °C/s.
    pub heating_rate: f64,
    /// Share of the excess over ambient lost per second.
    pub loss_coefficient: f64,
    /// Peak-to-peak sensor noise, °C.
    pub noise: f64,
}

impl Default for BathParameters {
    fn default() -> Self {
        Self {
            r0: 1000.0,
            reference_resistance: 3600.0,
            ambient: 20.0,
            initial_temperature: 20.0,
            heating_rate: 0.05,
            loss_coefficient: 0.0005,
            noise: 0.02,
        }
    }
}

#[derive(Debug)]
struct BathState {
    water: f64,
    heater_on: bool,
    heater_switches: u64,
    stirring: f64,
    last_update: Instant,
    registers: [u8; REGISTER_COUNT],
    fault_condition: u8,
    conversions: u64,
}

/// Shared handle to the simulated bath. Clones see the same water.
#[derive(Clone)]
pub struct SimulatedBath {
    params: BathParameters,
    state: Arc<Mutex<BathState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedBath {
    pub fn new(params: BathParameters, clock: Arc<dyn Clock>) -> Self {
        let mut registers = [0u8; REGISTER_COUNT];
        // Power-on threshold defaults
        registers[reg::FAULT_HT_MSB as usize] = 0xFF;
        registers[reg::FAULT_HT_LSB as usize] = 0xFF;
        let state = BathState {
            water: params.initial_temperature,
            heater_on: false,
            heater_switches: 0,
            stirring: 0.0,
            last_update: clock.now(),
            registers,
            fault_condition: 0,
            conversions: 0,
        };
        Self {
            params,
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    pub fn parameters(&self) -> &BathParameters {
        &self.params
    }

    fn lock(&self) -> MutexGuard<'_, BathState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.advance(&mut state);
        state
    }

    fn advance(&self, state: &mut BathState) {
        let now = self.clock.now();
        let dt = now.saturating_duration_since(state.last_update).as_secs_f64();
        state.last_update = now;
        if dt <= 0.0 {
            return;
        }
        let gain = if state.heater_on {
            self.params.heating_rate
        } else {
            0.0
        };
        // Stirring speeds up exchange with the surroundings a little
        let loss = self.params.loss_coefficient
            * (1.0 + 0.5 * state.stirring)
            * (state.water - self.params.ambient);
        state.water += (gain - loss) * dt;
    }

    fn convert(&self, state: &mut BathState) {
        let noise = self.params.noise * (rand::random::<f64>() - 0.5);
        let resistance = resistance_at(state.water + noise, self.params.r0);
        let code = (resistance / self.params.reference_resistance * f64::from(CODE_RANGE))
            .round()
            .clamp(0.0, f64::from(CODE_RANGE - 1)) as u16;
        let fault = state.fault_condition != 0;
        let word = (code << 1) | u16::from(fault);
        let [msb, lsb] = word.to_be_bytes();
        state.registers[reg::RTD_MSB as usize] = msb;
        state.registers[reg::RTD_LSB as usize] = lsb;
        state.registers[reg::FAULT_STATUS as usize] |= state.fault_condition;
        state.conversions += 1;
    }

    fn converting(state: &BathState) -> bool {
        let config = state.registers[reg::CONFIG as usize];
        config & CONFIG_BIAS != 0 && config & CONFIG_CONTINUOUS != 0
    }

    /// True water temperature.
    pub fn temperature(&self) -> f64 {
        self.lock().water
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.lock().water = celsius;
    }

    pub fn heater_on(&self) -> bool {
        self.lock().heater_on
    }

    /// Number of relay transitions seen so far.
    pub fn heater_switches(&self) -> u64 {
        self.lock().heater_switches
    }

    /// Motor drive as a fraction, zero while disabled.
    pub fn stirring(&self) -> f64 {
        self.lock().stirring
    }

    /// Current value of one emulated sensor register.
    pub fn register(&self, address: u8) -> u8 {
        self.lock().registers[usize::from(address) % REGISTER_COUNT]
    }

    /// Raise a persistent fault condition (fault-status bits). Conversions
    /// carry the fault bit until [`SimulatedBath::clear_fault`].
    pub fn inject_fault(&self, status: u8) {
        self.lock().fault_condition = status & 0xFC;
    }

    pub fn clear_fault(&self) {
        self.lock().fault_condition = 0;
    }

    pub fn conversions(&self) -> u64 {
        self.lock().conversions
    }

    pub fn register_bus(&self) -> SimRegisterBus {
        SimRegisterBus { bath: self.clone() }
    }

    pub fn ready_signal(&self) -> SimReadySignal {
        SimReadySignal {
            bath: self.clone(),
            last_clear: None,
        }
    }

    pub fn relay(&self) -> SimRelay {
        SimRelay { bath: self.clone() }
    }

    pub fn pwm(&self) -> SimPwm {
        SimPwm {
            bath: self.clone(),
            range: 1,
            data: 0,
            enabled: false,
        }
    }
}

/// Register-level MAX31865 emulation.
///
/// Addresses auto-increment within a frame like the real part. Reading the
/// RTD registers while bias and continuous conversion are on samples the
/// bath first.
pub struct SimRegisterBus {
    bath: SimulatedBath,
}

impl SimRegisterBus {
    fn write(bath: &SimulatedBath, state: &mut BathState, address: usize, value: u8) {
        match address as u8 {
            reg::CONFIG => {
                if value & CONFIG_FAULT_CLEAR != 0 {
                    state.registers[reg::FAULT_STATUS as usize] = 0;
                }
                if value & CONFIG_ONE_SHOT != 0 && value & CONFIG_BIAS != 0 {
                    bath.convert(state);
                }
                state.registers[address] =
                    value & !(CONFIG_ONE_SHOT | CONFIG_FAULT_CYCLE | CONFIG_FAULT_CLEAR);
            }
            reg::FAULT_HT_MSB..=reg::FAULT_LT_LSB => state.registers[address] = value,
            // RTD and fault status are read-only
            _ => {}
        }
    }
}

impl RegisterBus for SimRegisterBus {
    fn transfer(&mut self, frame: &mut [u8]) -> Result<(), HardwareError> {
        let Some((&mut command, payload)) = frame.split_first_mut() else {
            return Ok(());
        };
        let write = command & 0x80 != 0;
        let start = usize::from(command & 0x7F);

        let mut state = self.bath.lock();
        if !write
            && SimulatedBath::converting(&state)
            && (start..start + payload.len()).any(|a| a % REGISTER_COUNT == reg::RTD_MSB as usize)
        {
            self.bath.convert(&mut state);
        }
        for (offset, byte) in payload.iter_mut().enumerate() {
            let address = (start + offset) % REGISTER_COUNT;
            if write {
                Self::write(&self.bath, &mut state, address, *byte);
            } else {
                *byte = state.registers[address];
            }
        }
        frame[0] = 0;
        Ok(())
    }
}

/// DRDY emulation: ready one conversion period after the last clear while
/// the converter runs.
pub struct SimReadySignal {
    bath: SimulatedBath,
    last_clear: Option<Instant>,
}

impl ReadySignal for SimReadySignal {
    fn is_ready(&mut self) -> Result<bool, HardwareError> {
        let converting = SimulatedBath::converting(&self.bath.lock());
        let now = self.bath.clock.now();
        Ok(converting
            && self
                .last_clear
                .is_none_or(|t| now.saturating_duration_since(t) >= CONVERSION_PERIOD))
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        self.last_clear = Some(self.bath.clock.now());
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.last_clear = None;
        Ok(())
    }
}

pub struct SimRelay {
    bath: SimulatedBath,
}

impl Relay for SimRelay {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        let mut state = self.bath.lock();
        if state.heater_on != on {
            state.heater_switches += 1;
        }
        state.heater_on = on;
        Ok(())
    }
}

pub struct SimPwm {
    bath: SimulatedBath,
    range: u32,
    data: u32,
    enabled: bool,
}

impl SimPwm {
    fn apply(&self) {
        let drive = if self.enabled && self.range > 0 {
            (f64::from(self.data) / f64::from(self.range)).min(1.0)
        } else {
            0.0
        };
        self.bath.lock().stirring = drive;
    }
}

impl PwmOutput for SimPwm {
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        self.range = range;
        self.apply();
        Ok(())
    }

    fn set_data(&mut self, data: u32) -> Result<(), HardwareError> {
        self.data = data;
        self.apply();
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
        self.enabled = enabled;
        self.apply();
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.enabled = false;
        self.data = 0;
        self.apply();
        Ok(())
    }
}

/// Push button whose edge latch is set by [`SimButton::press`].
#[derive(Debug, Clone, Default)]
pub struct SimButton {
    latched: Arc<AtomicBool>,
}

impl SimButton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self) {
        self.latched.store(true, Ordering::Release);
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }
}

impl ButtonInput for SimButton {
    fn take_edge(&mut self) -> Result<bool, HardwareError> {
        Ok(self.latched.swap(false, Ordering::AcqRel))
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.latched.store(false, Ordering::Release);
        Ok(())
    }
}

/// Handles for pressing the simulated panel buttons.
#[derive(Debug, Clone, Default)]
pub struct SimButtons {
    pub increase_temperature: SimButton,
    pub decrease_temperature: SimButton,
    pub increase_motor: SimButton,
    pub decrease_motor: SimButton,
}

/// [`Board`] backed by a [`SimulatedBath`].
pub struct SimBoard {
    bath: SimulatedBath,
    buttons: SimButtons,
    data_ready: bool,
}

impl SimBoard {
    pub fn new(bath: SimulatedBath) -> Self {
        Self {
            bath,
            buttons: SimButtons::default(),
            data_ready: true,
        }
    }

    /// Leave the DRDY line unwired so the sensor falls back to timed polling.
    pub fn without_data_ready(mut self) -> Self {
        self.data_ready = false;
        self
    }

    pub fn bath(&self) -> &SimulatedBath {
        &self.bath
    }

    pub fn button_handles(&self) -> SimButtons {
        self.buttons.clone()
    }
}

impl Board for SimBoard {
    fn sensor_bus(&mut self) -> Result<Box<dyn RegisterBus>, HardwareError> {
        Ok(Box::new(self.bath.register_bus()))
    }

    fn data_ready(&mut self) -> Result<Option<Box<dyn ReadySignal>>, HardwareError> {
        if self.data_ready {
            Ok(Some(Box::new(self.bath.ready_signal())))
        } else {
            Ok(None)
        }
    }

    fn motor_pwm(&mut self) -> Result<Box<dyn PwmOutput>, HardwareError> {
        Ok(Box::new(self.bath.pwm()))
    }

    fn heater_relay(&mut self) -> Result<Box<dyn Relay>, HardwareError> {
        Ok(Box::new(self.bath.relay()))
    }

    fn buttons(&mut self) -> Result<ButtonSet, HardwareError> {
        let handles = self.buttons.clone();
        Ok(ButtonSet {
            increase_temperature: Box::new(handles.increase_temperature),
            decrease_temperature: Box::new(handles.decrease_temperature),
            increase_motor: Box::new(handles.increase_motor),
            decrease_motor: Box::new(handles.decrease_motor),
        })
    }
}
