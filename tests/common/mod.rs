// In-process fakes for the hardware seams, shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sousvide_rs::hardware::{HardwareError, PwmOutput, ReadySignal, RegisterBus, Relay};
use sousvide_rs::scheduler::ManualClock;

#[derive(Debug, Default)]
pub struct BusState {
    pub registers: [u8; 8],
    /// Every frame as sent, before the reply was filled in.
    pub frames: Vec<Vec<u8>>,
    /// Config register ignores writes and always reads back this value.
    pub stuck_config: Option<u8>,
    pub fail_transfers: bool,
    pub released: bool,
}

/// MAX31865 register file without a converter behind it. Tests set the RTD
/// word directly.
#[derive(Debug, Clone, Default)]
pub struct FakeBus {
    pub state: Arc<Mutex<BusState>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rtd(&self, code: u16, fault: bool) {
        let word = (code << 1) | u16::from(fault);
        let [msb, lsb] = word.to_be_bytes();
        let mut state = self.state.lock().unwrap();
        state.registers[1] = msb;
        state.registers[2] = lsb;
    }

    pub fn set_register(&self, address: usize, value: u8) {
        self.state.lock().unwrap().registers[address] = value;
    }

    pub fn register(&self, address: usize) -> u8 {
        self.state.lock().unwrap().registers[address]
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn clear_frames(&self) {
        self.state.lock().unwrap().frames.clear();
    }

    /// Number of reads that started at the RTD MSB register.
    pub fn rtd_reads(&self) -> usize {
        self.frames().iter().filter(|f| f[0] == 0x01).count()
    }

    pub fn released(&self) -> bool {
        self.state.lock().unwrap().released
    }
}

impl RegisterBus for FakeBus {
    fn transfer(&mut self, frame: &mut [u8]) -> Result<(), HardwareError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_transfers {
            return Err(HardwareError::Disconnected("fake bus".to_string()));
        }
        state.frames.push(frame.to_vec());
        let write = frame[0] & 0x80 != 0;
        let start = usize::from(frame[0] & 0x7F);
        for (offset, byte) in frame[1..].iter_mut().enumerate() {
            let address = (start + offset) % 8;
            if write {
                if address == 0 && state.stuck_config.is_some() {
                    continue;
                }
                state.registers[address] = *byte;
            } else if address == 0 {
                *byte = state.stuck_config.unwrap_or(state.registers[0]);
            } else {
                *byte = state.registers[address];
            }
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.state.lock().unwrap().released = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeReady {
    pub ready: Arc<AtomicBool>,
    pub released: Arc<AtomicBool>,
}

impl FakeReady {
    pub fn raise(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl ReadySignal for FakeReady {
    fn is_ready(&mut self) -> Result<bool, HardwareError> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Relay that records every write.
#[derive(Debug, Clone, Default)]
pub struct RecordingRelay {
    pub writes: Arc<Mutex<Vec<bool>>>,
}

impl RecordingRelay {
    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().unwrap().clone()
    }
}

impl Relay for RecordingRelay {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(on);
        Ok(())
    }
}

/// Relay whose writes take `latency` on a manual clock.
#[derive(Clone)]
pub struct SlowRelay {
    pub inner: RecordingRelay,
    pub clock: ManualClock,
    pub latency: Duration,
}

impl SlowRelay {
    pub fn writes(&self) -> Vec<bool> {
        self.inner.writes()
    }
}

impl Relay for SlowRelay {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        self.clock.advance(self.latency);
        self.inner.set(on)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmWrite {
    Range(u32),
    Data(u32),
    Enabled(bool),
    Release,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPwm {
    pub writes: Arc<Mutex<Vec<PwmWrite>>>,
}

impl RecordingPwm {
    pub fn writes(&self) -> Vec<PwmWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl PwmOutput for RecordingPwm {
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(PwmWrite::Range(range));
        Ok(())
    }

    fn set_data(&mut self, data: u32) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(PwmWrite::Data(data));
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(PwmWrite::Enabled(enabled));
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(PwmWrite::Release);
        Ok(())
    }
}
