// src/hardware/rpi.rs - Raspberry Pi backend (rppal)
use std::time::Duration;

use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use rppal::pwm::{Channel, Polarity, Pwm};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use super::{
    Board, ButtonInput, ButtonSet, HardwareError, PwmOutput, ReadySignal, RegisterBus, Relay,
};
use crate::config::Config;

/// MAX31865 on a spidev chip select. The chip samples on the second clock
/// edge (mode 1).
pub struct RpiSpiBus {
    spi: Spi,
    write: Vec<u8>,
}

impl RpiSpiBus {
    pub fn open(bus: u8, chip_select: u8, clock_hz: u32) -> Result<Self, HardwareError> {
        let bus = match bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            2 => Bus::Spi2,
            other => return Err(HardwareError::Unsupported(format!("SPI bus {other}"))),
        };
        let slave = match chip_select {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            other => {
                return Err(HardwareError::Unsupported(format!("chip select {other}")));
            }
        };
        let spi = Spi::new(bus, slave, clock_hz, Mode::Mode1)?;
        tracing::debug!("Opened {:?}/{:?} at {} Hz", bus, slave, clock_hz);
        Ok(Self {
            spi,
            write: Vec::with_capacity(8),
        })
    }
}

impl RegisterBus for RpiSpiBus {
    fn transfer(&mut self, frame: &mut [u8]) -> Result<(), HardwareError> {
        self.write.clear();
        self.write.extend_from_slice(frame);
        let done = self.spi.transfer(frame, &self.write)?;
        if done != frame.len() {
            return Err(HardwareError::ShortTransfer {
                done,
                expected: frame.len(),
            });
        }
        Ok(())
    }
}

/// DRDY is active low. A falling edge latches readiness until cleared.
pub struct RpiDataReady {
    pin: InputPin,
    latched: bool,
}

impl RpiDataReady {
    pub fn open(gpio: &Gpio, pin: u8) -> Result<Self, HardwareError> {
        let mut pin = gpio.get(pin)?.into_input_pullup();
        pin.set_interrupt(Trigger::FallingEdge)?;
        Ok(Self {
            pin,
            latched: false,
        })
    }
}

impl ReadySignal for RpiDataReady {
    fn is_ready(&mut self) -> Result<bool, HardwareError> {
        if self.pin.poll_interrupt(false, Some(Duration::ZERO))?.is_some() {
            self.latched = true;
        }
        Ok(self.latched || self.pin.is_low())
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        self.latched = false;
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.latched = false;
        self.pin.clear_interrupt()?;
        Ok(())
    }
}

pub struct RpiRelay {
    pin: OutputPin,
    active_low: bool,
}

impl RpiRelay {
    pub fn open(gpio: &Gpio, pin: u8, active_low: bool) -> Result<Self, HardwareError> {
        let pin = gpio.get(pin)?;
        let pin = if active_low {
            pin.into_output_high()
        } else {
            pin.into_output_low()
        };
        Ok(Self { pin, active_low })
    }
}

impl Relay for RpiRelay {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
}

/// Hardware PWM channel. rppal takes a duty fraction, so data/range are
/// kept here and divided on every write.
pub struct RpiPwm {
    pwm: Pwm,
    range: u32,
    data: u32,
}

impl RpiPwm {
    pub fn open(channel: u8, frequency_hz: f64) -> Result<Self, HardwareError> {
        let channel = match channel {
            0 => Channel::Pwm0,
            1 => Channel::Pwm1,
            other => return Err(HardwareError::Unsupported(format!("PWM channel {other}"))),
        };
        let pwm = Pwm::with_frequency(channel, frequency_hz, 0.0, Polarity::Normal, false)?;
        Ok(Self {
            pwm,
            range: 1,
            data: 0,
        })
    }

    fn write_duty(&mut self) -> Result<(), HardwareError> {
        let duty = if self.range == 0 {
            0.0
        } else {
            (f64::from(self.data) / f64::from(self.range)).min(1.0)
        };
        self.pwm.set_duty_cycle(duty)?;
        Ok(())
    }
}

impl PwmOutput for RpiPwm {
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        self.range = range;
        self.write_duty()
    }

    fn set_data(&mut self, data: u32) -> Result<(), HardwareError> {
        self.data = data;
        self.write_duty()
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
        if enabled {
            self.pwm.enable()?;
        } else {
            self.pwm.disable()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.data = 0;
        self.write_duty()?;
        self.pwm.disable()?;
        Ok(())
    }
}

/// Push button to ground with the internal pull-up. The edge latch is the
/// kernel's interrupt status.
pub struct RpiButton {
    pin: InputPin,
}

impl RpiButton {
    pub fn open(gpio: &Gpio, pin: u8) -> Result<Self, HardwareError> {
        let mut pin = gpio.get(pin)?.into_input_pullup();
        pin.set_interrupt(Trigger::RisingEdge)?;
        Ok(Self { pin })
    }
}

impl ButtonInput for RpiButton {
    fn take_edge(&mut self) -> Result<bool, HardwareError> {
        Ok(self
            .pin
            .poll_interrupt(true, Some(Duration::ZERO))?
            .is_some())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.pin.clear_interrupt()?;
        Ok(())
    }
}

/// [`Board`] for the Raspberry Pi wiring described in the config file.
pub struct RpiBoard {
    gpio: Gpio,
    config: Config,
}

impl RpiBoard {
    pub fn new(config: &Config) -> Result<Self, HardwareError> {
        let gpio = Gpio::new()?;
        Ok(Self {
            gpio,
            config: config.clone(),
        })
    }
}

impl Board for RpiBoard {
    fn sensor_bus(&mut self) -> Result<Box<dyn RegisterBus>, HardwareError> {
        let sensor = &self.config.sensor;
        Ok(Box::new(RpiSpiBus::open(
            sensor.spi_bus,
            sensor.chip_select,
            sensor.clock_hz,
        )?))
    }

    fn data_ready(&mut self) -> Result<Option<Box<dyn ReadySignal>>, HardwareError> {
        match self.config.sensor.data_ready_pin {
            Some(pin) => Ok(Some(Box::new(RpiDataReady::open(&self.gpio, pin)?))),
            None => Ok(None),
        }
    }

    fn motor_pwm(&mut self) -> Result<Box<dyn PwmOutput>, HardwareError> {
        let motor = &self.config.motor;
        Ok(Box::new(RpiPwm::open(motor.pwm_channel, motor.frequency_hz)?))
    }

    fn heater_relay(&mut self) -> Result<Box<dyn Relay>, HardwareError> {
        let heater = &self.config.heater;
        Ok(Box::new(RpiRelay::open(
            &self.gpio,
            heater.relay_pin,
            heater.active_low,
        )?))
    }

    fn buttons(&mut self) -> Result<ButtonSet, HardwareError> {
        let pins = &self.config.buttons;
        Ok(ButtonSet {
            increase_temperature: Box::new(RpiButton::open(&self.gpio, pins.increase_temperature_pin)?),
            decrease_temperature: Box::new(RpiButton::open(&self.gpio, pins.decrease_temperature_pin)?),
            increase_motor: Box::new(RpiButton::open(&self.gpio, pins.increase_motor_pin)?),
            decrease_motor: Box::new(RpiButton::open(&self.gpio, pins.decrease_motor_pin)?),
        })
    }
}
