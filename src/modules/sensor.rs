//! Analog sensor channels
//!
//! A channel samples one analog input, averaging up to [`MAX_SAMPLES`] reads
//! per sample. Touch pads, hall sensors and thermistors wired to an analog
//! input all fit here. With a threshold set, every tick samples the channel
//! and raises `ExternalInterrupt` when the value crosses into the triggering
//! side; it re-arms once the value is back on the other side.

use tracing::{debug, info, warn};

use crate::core::{CommandError, HardwareError, ModuleKind};
use crate::firmware::EventReason;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{allocate, unit_mut, ModuleContext, ModuleHandler};

/// Command ids of the sensor module
pub mod cmd {
    pub const ATTACH: u8 = 0;
    pub const READ: u8 = 1;
    pub const SET_THRESHOLD: u8 = 2;
    pub const CLEAR_THRESHOLD: u8 = 3;
    pub const SET_SAMPLES: u8 = 4;
    pub const TRIGGERED: u8 = 5;
    pub const DETACH: u8 = 6;
}

/// Upper bound on reads averaged into one sample
pub const MAX_SAMPLES: u8 = 16;

#[derive(Debug, Clone, Copy)]
struct Threshold {
    level: u16,
    /// Triggers below `level` when true, above it otherwise
    falling: bool,
}

impl Threshold {
    fn crossed(&self, value: u16) -> bool {
        if self.falling {
            value < self.level
        } else {
            value > self.level
        }
    }
}

#[derive(Debug)]
struct Channel {
    pin: u8,
    samples: u8,
    threshold: Option<Threshold>,
    triggered: bool,
}

impl Channel {
    fn new(pin: u8) -> Self {
        Channel {
            pin,
            samples: 1,
            threshold: None,
            triggered: false,
        }
    }

    /// Mean of `samples` reads
    fn sample<B: Board>(&self, board: &mut B) -> Result<u16, HardwareError> {
        let mut sum = 0u32;
        for _ in 0..self.samples {
            sum += board.analog_read(self.pin)? as u32;
        }
        Ok((sum / self.samples as u32) as u16)
    }
}

/// Up to `max_sensors` analog channels
#[derive(Debug)]
pub struct SensorModule {
    channels: Vec<Option<Channel>>,
}

impl SensorModule {
    pub fn new(max_sensors: usize) -> Self {
        SensorModule {
            channels: (0..max_sensors).map(|_| None).collect(),
        }
    }

    /// True while a unit's last sample sits on the triggering side
    pub fn triggered(&self, unit: u8) -> Option<bool> {
        self.channels.get(unit as usize)?.as_ref().map(|channel| channel.triggered)
    }

    fn attach<B: Board>(&mut self, pin: u8, board: &mut B) -> Result<Reply, CommandError> {
        if self.channels.iter().flatten().any(|channel| channel.pin == pin) {
            return Err(CommandError::invalid(format!("pin {} is already a sensor", pin)));
        }
        if !self.channels.iter().any(Option::is_none) {
            return Err(CommandError::invalid("no free sensor unit"));
        }
        board.check_pin(pin)?;
        board.pin_mode(pin, PinMode::Input)?;
        let unit = allocate(&mut self.channels, Channel::new(pin))?;
        info!("sensor {} attached on pin {}", unit, pin);
        Ok(Reply::ok().u8(unit))
    }
}

impl ModuleHandler for SensorModule {
    const KIND: ModuleKind = ModuleKind::Sensor;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        if command.command_id > cmd::DETACH {
            return Err(CommandError::UnknownCommand(command.command_id));
        }
        let mut args = ArgReader::new(&command.args);
        if command.command_id == cmd::ATTACH {
            let pin = args.u8()?;
            args.finish()?;
            return self.attach(pin, ctx.board);
        }

        let unit = command.unit;
        let channel = unit_mut(&mut self.channels, unit)?;
        let reply = match command.command_id {
            cmd::READ => {
                args.finish()?;
                Reply::ok().u16(channel.sample(ctx.board)?)
            }
            cmd::SET_THRESHOLD => {
                let level = args.u16()?;
                let falling = args.bool()?;
                args.finish()?;
                let threshold = Threshold { level, falling };
                // Already past the threshold counts as triggered, no event
                channel.triggered = threshold.crossed(channel.sample(ctx.board)?);
                channel.threshold = Some(threshold);
                debug!(
                    "sensor {} triggers {} {}",
                    unit,
                    if falling { "below" } else { "above" },
                    level
                );
                Reply::ok()
            }
            cmd::CLEAR_THRESHOLD => {
                args.finish()?;
                channel.threshold = None;
                channel.triggered = false;
                Reply::ok()
            }
            cmd::SET_SAMPLES => {
                let samples = args.u8()?;
                args.finish()?;
                if samples == 0 || samples > MAX_SAMPLES {
                    return Err(CommandError::invalid(format!(
                        "sample count {} outside 1..={}",
                        samples, MAX_SAMPLES
                    )));
                }
                channel.samples = samples;
                Reply::ok()
            }
            cmd::TRIGGERED => {
                args.finish()?;
                Reply::ok().bool(channel.triggered)
            }
            cmd::DETACH => {
                args.finish()?;
                self.channels[unit as usize] = None;
                info!("sensor {} detached", unit);
                Reply::ok()
            }
            other => return Err(CommandError::UnknownCommand(other)),
        };
        Ok(reply)
    }

    fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for (unit, slot) in self.channels.iter_mut().enumerate() {
            let Some(channel) = slot else { continue };
            let Some(threshold) = channel.threshold else { continue };

            let value = match channel.sample(ctx.board) {
                Ok(value) => value,
                Err(e) => {
                    warn!("sensor {} dropped its threshold: {}", unit, e);
                    channel.threshold = None;
                    channel.triggered = false;
                    ctx.raise(EventReason::HardwareFault, unit as u8, channel.pin as i32);
                    continue;
                }
            };
            let crossed = threshold.crossed(value);
            if crossed && !channel.triggered {
                debug!("sensor {} crossed {} at {}", unit, threshold.level, value);
                ctx.raise(EventReason::ExternalInterrupt, unit as u8, value as i32);
            }
            channel.triggered = crossed;
        }
    }

    fn reset<B: Board>(&mut self, _ctx: &mut ModuleContext<'_, B>) {
        for slot in self.channels.iter_mut() {
            *slot = None;
        }
    }
}
