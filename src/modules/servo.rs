//! Hobby servos
//!
//! Direct writes set the pulse width at once. `SWEEP` arms a background move
//! at a bounded angular rate which the tick advances.

use tracing::{debug, info, warn};

use crate::core::{CommandError, HardwareError, ModuleKind};
use crate::firmware::EventReason;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{allocate, unit_mut, Action, ActionPhase, ModuleContext, ModuleHandler};

/// Command ids of the servo module
pub mod cmd {
    pub const ATTACH: u8 = 0;
    pub const DETACH: u8 = 1;
    pub const WRITE: u8 = 2;
    pub const WRITE_MICROSECONDS: u8 = 3;
    pub const READ: u8 = 4;
    pub const READ_MICROSECONDS: u8 = 5;
    pub const ATTACHED: u8 = 6;
    pub const SWEEP: u8 = 7;
    pub const STOP: u8 = 8;
    pub const GET_STATE: u8 = 9;
    pub const CLEAR: u8 = 10;
}

pub const MAX_ANGLE: u16 = 180;

/// Pulse width a freshly attached servo is driven to
const NEUTRAL_US: u16 = 1500;

#[derive(Debug)]
struct Channel {
    pin: u8,
    min_us: u16,
    max_us: u16,
    micros: u16,
    attached: bool,
    action: Action,
    /// Angle during a sweep, fractional degrees
    angle: f64,
    target: f64,
    /// Degrees per second
    rate: f64,
    last_tick: u64,
}

impl Channel {
    fn new(pin: u8, min_us: u16, max_us: u16) -> Self {
        Channel {
            pin,
            min_us,
            max_us,
            micros: NEUTRAL_US.clamp(min_us, max_us),
            attached: true,
            action: Action::default(),
            angle: 0.0,
            target: 0.0,
            rate: 0.0,
            last_tick: 0,
        }
    }

    fn to_micros(&self, angle: f64) -> u16 {
        let span = (self.max_us - self.min_us) as f64;
        (self.min_us as f64 + span * angle / MAX_ANGLE as f64).round() as u16
    }

    fn to_angle(&self, micros: u16) -> f64 {
        let span = (self.max_us - self.min_us) as f64;
        (micros.saturating_sub(self.min_us)) as f64 * MAX_ANGLE as f64 / span
    }

    fn angle(&self) -> u16 {
        self.to_angle(self.micros).round() as u16
    }

    /// Stores the pulse width and drives it if attached
    fn write_micros<B: Board>(&mut self, board: &mut B, micros: u16) -> Result<(), HardwareError> {
        if self.attached {
            board.servo_pulse(self.pin, micros)?;
        }
        self.micros = micros;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), CommandError> {
        if self.action.is_active() {
            return Err(CommandError::invalid("servo is sweeping"));
        }
        Ok(())
    }

    fn finish<B: Board>(&mut self, unit: u8, stopped: bool, ctx: &mut ModuleContext<'_, B>) {
        self.action.complete(stopped);
        let reason = if stopped {
            EventReason::ActionStopped
        } else {
            EventReason::ActionCompleted
        };
        debug!("servo {} sweep finished at {} degrees", unit, self.angle());
        ctx.raise(reason, unit, self.angle() as i32);
    }

    fn tick<B: Board>(&mut self, unit: u8, ctx: &mut ModuleContext<'_, B>) {
        match self.action.phase() {
            ActionPhase::Armed => {
                if self.action.stop_requested() {
                    self.finish(unit, true, ctx);
                    return;
                }
                self.action.begin();
                self.angle = self.to_angle(self.micros);
                self.last_tick = ctx.now;
                return;
            }
            ActionPhase::InProgress => {}
            _ => return,
        }

        if self.action.stop_requested() {
            self.finish(unit, true, ctx);
            return;
        }

        let dt = ctx.now.saturating_sub(self.last_tick) as f64 / 1000.0;
        self.last_tick = ctx.now;
        let remaining = self.target - self.angle;
        let step = self.rate * dt;
        if step >= remaining.abs() {
            self.angle = self.target;
        } else {
            self.angle += step * remaining.signum();
        }

        let micros = self.to_micros(self.angle);
        if let Err(e) = self.write_micros(ctx.board, micros) {
            warn!("servo {} faulted during sweep: {}", unit, e);
            self.action.fault();
            ctx.raise(EventReason::HardwareFault, unit, self.angle() as i32);
            return;
        }
        if self.angle == self.target {
            self.finish(unit, false, ctx);
        }
    }
}

/// Up to `max_servos` servo channels
#[derive(Debug)]
pub struct ServoModule {
    channels: Vec<Option<Channel>>,
}

impl ServoModule {
    pub fn new(max_servos: usize) -> Self {
        ServoModule {
            channels: (0..max_servos).map(|_| None).collect(),
        }
    }

    pub fn phase(&self, unit: u8) -> Option<ActionPhase> {
        self.channels.get(unit as usize)?.as_ref().map(|channel| channel.action.phase())
    }

    fn attach<B: Board>(&mut self, pin: u8, min_us: u16, max_us: u16, board: &mut B) -> Result<Reply, CommandError> {
        if min_us >= max_us {
            return Err(CommandError::invalid(format!(
                "pulse range {}..{} us is empty",
                min_us, max_us
            )));
        }
        if !self.channels.iter().any(Option::is_none) {
            return Err(CommandError::invalid("no free servo unit"));
        }
        board.check_pin(pin)?;
        board.pin_mode(pin, PinMode::Output)?;

        let mut channel = Channel::new(pin, min_us, max_us);
        let micros = channel.micros;
        channel.write_micros(board, micros)?;
        let unit = allocate(&mut self.channels, channel)?;
        info!("servo {} attached on pin {}", unit, pin);
        Ok(Reply::ok().u8(unit))
    }
}

impl ModuleHandler for ServoModule {
    const KIND: ModuleKind = ModuleKind::Servo;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        if command.command_id > cmd::CLEAR {
            return Err(CommandError::UnknownCommand(command.command_id));
        }
        let mut args = ArgReader::new(&command.args);
        if command.command_id == cmd::ATTACH {
            let pin = args.u8()?;
            let min_us = args.u16()?;
            let max_us = args.u16()?;
            args.finish()?;
            return self.attach(pin, min_us, max_us, ctx.board);
        }

        let unit = command.unit;
        let channel = unit_mut(&mut self.channels, unit)?;
        let reply = match command.command_id {
            cmd::DETACH => {
                args.finish()?;
                if channel.action.is_active() {
                    channel.finish(unit, true, ctx);
                }
                channel.attached = false;
                if let Err(e) = ctx.board.pin_mode(channel.pin, PinMode::Input) {
                    warn!("failed to release servo pin {}: {}", channel.pin, e);
                }
                debug!("servo {} detached", unit);
                Reply::ok()
            }
            cmd::WRITE => {
                let angle = args.u16()?;
                args.finish()?;
                if angle > MAX_ANGLE {
                    return Err(CommandError::invalid(format!("angle {} exceeds {}", angle, MAX_ANGLE)));
                }
                channel.ensure_idle()?;
                let micros = channel.to_micros(angle as f64);
                channel.write_micros(ctx.board, micros)?;
                Reply::ok()
            }
            cmd::WRITE_MICROSECONDS => {
                let micros = args.u16()?;
                args.finish()?;
                if micros < channel.min_us || micros > channel.max_us {
                    return Err(CommandError::invalid(format!(
                        "{} us outside {}..={} us",
                        micros, channel.min_us, channel.max_us
                    )));
                }
                channel.ensure_idle()?;
                channel.write_micros(ctx.board, micros)?;
                Reply::ok()
            }
            cmd::READ => {
                args.finish()?;
                Reply::ok().u16(channel.angle())
            }
            cmd::READ_MICROSECONDS => {
                args.finish()?;
                Reply::ok().u16(channel.micros)
            }
            cmd::ATTACHED => {
                args.finish()?;
                Reply::ok().bool(channel.attached)
            }
            cmd::SWEEP => {
                let angle = args.u16()?;
                let rate = args.u16()?;
                args.finish()?;
                if angle > MAX_ANGLE {
                    return Err(CommandError::invalid(format!("angle {} exceeds {}", angle, MAX_ANGLE)));
                }
                if rate == 0 {
                    return Err(CommandError::invalid("sweep rate must be positive"));
                }
                if !channel.attached {
                    return Err(CommandError::invalid("servo is detached"));
                }
                channel.target = angle as f64;
                channel.rate = rate as f64;
                channel.action.arm();
                Reply::accepted()
            }
            cmd::STOP => {
                args.finish()?;
                if channel.action.request_stop() {
                    Reply::accepted()
                } else {
                    Reply::ok()
                }
            }
            cmd::GET_STATE => {
                args.finish()?;
                Reply::ok().u8(channel.action.phase().code())
            }
            cmd::CLEAR => {
                args.finish()?;
                if !channel.action.clear() {
                    return Err(CommandError::invalid("cannot clear a sweep in progress"));
                }
                Reply::ok()
            }
            other => return Err(CommandError::UnknownCommand(other)),
        };
        Ok(reply)
    }

    fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for (unit, slot) in self.channels.iter_mut().enumerate() {
            if let Some(channel) = slot {
                channel.tick(unit as u8, ctx);
            }
        }
    }

    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for slot in self.channels.iter_mut() {
            if let Some(channel) = slot.take() {
                if let Err(e) = ctx.board.pin_mode(channel.pin, PinMode::Input) {
                    warn!("failed to release servo pin {}: {}", channel.pin, e);
                }
            }
        }
    }
}
