//! Hardware abstraction
//!
//! Modules never touch registers directly; everything physical goes through
//! a [`Board`]. Real targets implement it over their pin drivers, tests and
//! the demo use [`SimulatedBoard`].

mod sim;

pub use self::sim::SimulatedBoard;

use crate::core::HardwareError;

/// Electrical mode of a digital pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinMode {
    Input = 0,
    Output = 1,
    InputPullup = 2,
}

impl PinMode {
    /// Parses a wire mode byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            2 => Some(PinMode::InputPullup),
            _ => None,
        }
    }
}

/// The peripheral-side board the firmware drives
pub trait Board {
    /// Number of addressable pins, valid pins are `0..pin_count()`
    fn pin_count(&self) -> u8;

    /// Milliseconds since boot, monotonic
    fn millis(&self) -> u64;

    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), HardwareError>;

    fn digital_read(&mut self, pin: u8) -> Result<bool, HardwareError>;

    fn digital_write(&mut self, pin: u8, high: bool) -> Result<(), HardwareError>;

    fn analog_read(&mut self, pin: u8) -> Result<u16, HardwareError>;

    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), HardwareError>;

    /// Emits `count` step pulses on `pin`
    fn pulse(&mut self, pin: u8, count: u32) -> Result<(), HardwareError>;

    /// Sets the servo pulse width on `pin`
    fn servo_pulse(&mut self, pin: u8, micros: u16) -> Result<(), HardwareError>;

    /// Fails with `PinOutOfRange` unless `pin` exists on this board
    fn check_pin(&self, pin: u8) -> Result<(), HardwareError> {
        let count = self.pin_count();
        if pin >= count {
            return Err(HardwareError::PinOutOfRange { pin, count });
        }
        Ok(())
    }
}
