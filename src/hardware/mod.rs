// src/hardware/mod.rs - Device seams between the control core and the board
//
// The control code only talks to the traits below. `rpi` implements them on a
// Raspberry Pi through rppal, `sim` implements them against a simulated bath.
pub mod max31865;
#[cfg(feature = "rpi")]
pub mod rpi;
pub mod sim;

pub use max31865::{
    AcquisitionMode, ConversionMode, FaultCycle, FaultStatus, FaultThresholds, Max31865,
    NoiseFilter, RtdReading, SensorConfig, SensorError, TemperatureReading, Wiring,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "rpi")]
    #[error("SPI error: {0}")]
    Spi(#[from] rppal::spi::Error),
    #[cfg(feature = "rpi")]
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[cfg(feature = "rpi")]
    #[error("PWM error: {0}")]
    Pwm(#[from] rppal::pwm::Error),
    #[error("Short SPI transfer: {done} of {expected} bytes")]
    ShortTransfer { done: usize, expected: usize },
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Full-duplex register bus (SPI with a dedicated chip select).
///
/// `transfer` clocks `frame` out MSB-first and replaces it in place with the
/// bytes clocked in. Transfers block until done; there is no timeout.
pub trait RegisterBus: Send {
    fn transfer(&mut self, frame: &mut [u8]) -> Result<(), HardwareError>;

    /// Return the bus pins to their idle state.
    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Latched "conversion finished" line of the sensor (MAX31865 DRDY).
pub trait ReadySignal: Send {
    /// True if a conversion finished since the last [`ReadySignal::clear`].
    fn is_ready(&mut self) -> Result<bool, HardwareError>;
    fn clear(&mut self) -> Result<(), HardwareError>;
    /// Disable edge detection and clear any pending edge status.
    fn release(&mut self) -> Result<(), HardwareError>;
}

/// Solid state relay switching the heating element.
pub trait Relay: Send {
    fn set(&mut self, on: bool) -> Result<(), HardwareError>;
}

/// PWM channel driving the stirring motor, expressed as data/range like the
/// BCM2835 PWM peripheral.
pub trait PwmOutput: Send {
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError>;
    fn set_data(&mut self, data: u32) -> Result<(), HardwareError>;
    fn set_enabled(&mut self, enabled: bool) -> Result<(), HardwareError>;

    /// Give the pin back (input, no output).
    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Rising-edge latch of one push button.
pub trait ButtonInput: Send {
    /// Returns and clears the latched edge.
    fn take_edge(&mut self) -> Result<bool, HardwareError>;

    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// The four front-panel buttons.
pub struct ButtonSet {
    pub increase_temperature: Box<dyn ButtonInput>,
    pub decrease_temperature: Box<dyn ButtonInput>,
    pub increase_motor: Box<dyn ButtonInput>,
    pub decrease_motor: Box<dyn ButtonInput>,
}

/// Hands out the devices of one board. Startup acquires them one at a time,
/// in this order, so a failure only has to unwind what was already handed
/// out.
pub trait Board {
    fn sensor_bus(&mut self) -> Result<Box<dyn RegisterBus>, HardwareError>;
    /// `None` when no DRDY line is wired and the sensor must be polled.
    fn data_ready(&mut self) -> Result<Option<Box<dyn ReadySignal>>, HardwareError>;
    fn motor_pwm(&mut self) -> Result<Box<dyn PwmOutput>, HardwareError>;
    fn heater_relay(&mut self) -> Result<Box<dyn Relay>, HardwareError>;
    fn buttons(&mut self) -> Result<ButtonSet, HardwareError>;
}

impl<T: RegisterBus + ?Sized> RegisterBus for Box<T> {
    fn transfer(&mut self, frame: &mut [u8]) -> Result<(), HardwareError> {
        (**self).transfer(frame)
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        (**self).release()
    }
}

impl<T: Relay + ?Sized> Relay for Box<T> {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        (**self).set(on)
    }
}

impl<T: PwmOutput + ?Sized> PwmOutput for Box<T> {
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        (**self).set_range(range)
    }

    fn set_data(&mut self, data: u32) -> Result<(), HardwareError> {
        (**self).set_data(data)
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
        (**self).set_enabled(enabled)
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        (**self).release()
    }
}
