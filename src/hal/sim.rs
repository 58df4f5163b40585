use crate::core::HardwareError;
use super::{Board, PinMode};

/// State of one simulated pin
#[derive(Debug, Clone)]
struct SimPin {
    mode: PinMode,
    level: bool,
    analog_in: u16,
    analog_out: u16,
    pulses: u64,
    servo_micros: Option<u16>,
    fault: Option<String>,
}

impl Default for SimPin {
    fn default() -> Self {
        SimPin {
            mode: PinMode::Input,
            level: false,
            analog_in: 0,
            analog_out: 0,
            pulses: 0,
            servo_micros: None,
            fault: None,
        }
    }
}

/// In-memory board with a manual clock and fault injection
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pins: Vec<SimPin>,
    clock_ms: u64,
    /// Digital writes in order, kept once recording is on
    writes: Option<Vec<(u8, bool)>>,
}

impl SimulatedBoard {
    /// Creates a board with `pin_count` pins, all inputs, clock at zero
    pub fn new(pin_count: u8) -> Self {
        SimulatedBoard {
            pins: vec![SimPin::default(); pin_count as usize],
            clock_ms: 0,
            writes: None,
        }
    }

    /// Starts logging every successful digital write
    pub fn record_writes(&mut self) {
        self.writes = Some(Vec::new());
    }

    /// Writes logged since the last call, as `(pin, level)` pairs
    pub fn take_writes(&mut self) -> Vec<(u8, bool)> {
        self.writes.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Moves the clock forward
    pub fn advance(&mut self, millis: u64) {
        self.clock_ms += millis;
    }

    /// Drives an input pin from outside the board
    pub fn set_level(&mut self, pin: u8, high: bool) {
        if let Some(p) = self.pins.get_mut(pin as usize) {
            p.level = high;
        }
    }

    /// Sets the value the next analog read of `pin` returns
    pub fn set_analog_input(&mut self, pin: u8, value: u16) {
        if let Some(p) = self.pins.get_mut(pin as usize) {
            p.analog_in = value;
        }
    }

    /// Makes every subsequent operation on `pin` fail
    pub fn inject_fault(&mut self, pin: u8, reason: impl Into<String>) {
        if let Some(p) = self.pins.get_mut(pin as usize) {
            p.fault = Some(reason.into());
        }
    }

    pub fn clear_fault(&mut self, pin: u8) {
        if let Some(p) = self.pins.get_mut(pin as usize) {
            p.fault = None;
        }
    }

    /// Current logic level of `pin`
    pub fn level(&self, pin: u8) -> bool {
        self.pins.get(pin as usize).map_or(false, |p| p.level)
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.pins.get(pin as usize).map(|p| p.mode)
    }

    /// Total step pulses emitted on `pin`
    pub fn pulses(&self, pin: u8) -> u64 {
        self.pins.get(pin as usize).map_or(0, |p| p.pulses)
    }

    /// Last servo pulse width written to `pin`
    pub fn servo_micros(&self, pin: u8) -> Option<u16> {
        self.pins.get(pin as usize).and_then(|p| p.servo_micros)
    }

    /// Last PWM value written to `pin`
    pub fn analog_output(&self, pin: u8) -> u16 {
        self.pins.get(pin as usize).map_or(0, |p| p.analog_out)
    }

    fn pin_mut(&mut self, pin: u8) -> Result<&mut SimPin, HardwareError> {
        self.check_pin(pin)?;
        let p = &mut self.pins[pin as usize];
        if let Some(reason) = &p.fault {
            return Err(HardwareError::Fault {
                pin,
                reason: reason.clone(),
            });
        }
        Ok(p)
    }
}

impl Board for SimulatedBoard {
    fn pin_count(&self) -> u8 {
        self.pins.len() as u8
    }

    fn millis(&self) -> u64 {
        self.clock_ms
    }

    fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), HardwareError> {
        let p = self.pin_mut(pin)?;
        p.mode = mode;
        if mode == PinMode::InputPullup {
            p.level = true;
        }
        Ok(())
    }

    fn digital_read(&mut self, pin: u8) -> Result<bool, HardwareError> {
        Ok(self.pin_mut(pin)?.level)
    }

    fn digital_write(&mut self, pin: u8, high: bool) -> Result<(), HardwareError> {
        self.pin_mut(pin)?.level = high;
        if let Some(writes) = self.writes.as_mut() {
            writes.push((pin, high));
        }
        Ok(())
    }

    fn analog_read(&mut self, pin: u8) -> Result<u16, HardwareError> {
        Ok(self.pin_mut(pin)?.analog_in)
    }

    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), HardwareError> {
        self.pin_mut(pin)?.analog_out = value;
        Ok(())
    }

    fn pulse(&mut self, pin: u8, count: u32) -> Result<(), HardwareError> {
        self.pin_mut(pin)?.pulses += count as u64;
        Ok(())
    }

    fn servo_pulse(&mut self, pin: u8, micros: u16) -> Result<(), HardwareError> {
        self.pin_mut(pin)?.servo_micros = Some(micros);
        Ok(())
    }
}
