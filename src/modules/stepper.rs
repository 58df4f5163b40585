//! Stepper motor axes
//!
//! `START`/`MOVE` only arm a move. The tick integrates a trapezoidal speed
//! profile over the time elapsed on the board clock, emits the whole steps
//! crossed, and checks the endstops. Each tick integrates at most
//! [`MAX_TICK_MS`] so a late tick never produces a long blocking burst.

use tracing::{debug, info, warn};

use crate::core::{CommandError, HardwareError, ModuleKind};
use crate::firmware::EventReason;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{allocate, unit_mut, Action, ActionPhase, ModuleContext, ModuleHandler};

/// Command ids of the stepper module
pub mod cmd {
    pub const ATTACH: u8 = 0;
    pub const START: u8 = 1;
    pub const MOVE: u8 = 2;
    pub const STOP: u8 = 3;
    pub const SET_MAX_SPEED: u8 = 4;
    pub const SET_ACCELERATION: u8 = 5;
    pub const CURRENT_POSITION: u8 = 6;
    pub const SET_CURRENT_POSITION: u8 = 7;
    pub const DISTANCE_TO_GO: u8 = 8;
    pub const TARGET_POSITION: u8 = 9;
    pub const SPEED: u8 = 10;
    pub const GET_STATE: u8 = 11;
    pub const SET_ENDSTOP: u8 = 12;
    pub const ENABLE_ENDSTOPS: u8 = 13;
    pub const ENDSTOPS: u8 = 14;
    pub const CLEAR: u8 = 15;
    pub const DETACH: u8 = 16;
}

/// Endstops per axis
pub const MAX_ENDSTOPS: usize = 2;

/// Longest stretch of time one tick integrates over
pub const MAX_TICK_MS: u64 = 50;

/// `enable_pin` value meaning the driver has no enable line
const NO_PIN: u8 = 0xFF;

const DEFAULT_MAX_SPEED: f64 = 1000.0;
const DEFAULT_ACCELERATION: f64 = 1000.0;

/// Segment of the trapezoid the axis is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ramp {
    Accelerating,
    Cruising,
    Decelerating,
}

/// Position and speed of one axis, in steps and steps/s
#[derive(Debug, Clone)]
pub struct Profile {
    position: f64,
    target: i32,
    speed: f64,
    max_speed: f64,
    acceleration: f64,
    ramp: Option<Ramp>,
    /// Set once the approach to the current target has started braking
    braking: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            position: 0.0,
            target: 0,
            speed: 0.0,
            max_speed: DEFAULT_MAX_SPEED,
            acceleration: DEFAULT_ACCELERATION,
            ramp: None,
            braking: false,
        }
    }
}

impl Profile {
    /// Position rounded to whole steps
    pub fn position(&self) -> i32 {
        self.position.round() as i32
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    /// Signed speed, positive towards increasing positions
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn ramp(&self) -> Option<Ramp> {
        self.ramp
    }

    pub fn distance_to_go(&self) -> i32 {
        let distance = self.target as i64 - self.position() as i64;
        distance.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    pub fn at_target(&self) -> bool {
        self.speed == 0.0 && self.position() == self.target
    }

    fn set_position(&mut self, position: i32) {
        self.position = position as f64;
        self.target = position;
        self.speed = 0.0;
        self.ramp = None;
        self.braking = false;
    }

    fn set_target(&mut self, target: i32) {
        if target != self.target {
            self.braking = false;
        }
        self.target = target;
    }

    /// Slowest speed used on the final approach, so a move cannot stall short
    fn crawl_speed(&self) -> f64 {
        self.acceleration.sqrt().min(self.max_speed)
    }

    /// Integrates `dt` seconds towards the target, returns signed whole steps crossed
    pub fn advance(&mut self, dt: f64) -> i64 {
        let before = self.position.round() as i64;
        let remaining = self.target as f64 - self.position;
        if remaining.abs() < 0.5 {
            self.arrive();
            return self.target as i64 - before;
        }

        let dir = remaining.signum();
        let dv = self.acceleration * dt;
        let towards = self.speed * dir;
        let braking_distance = self.speed * self.speed / (2.0 * self.acceleration);

        if towards < 0.0 {
            // Still heading away from a new target: brake through zero
            self.speed += dir * dv;
            self.ramp = Some(Ramp::Decelerating);
        } else if self.braking || braking_distance >= remaining.abs() {
            self.braking = true;
            self.speed = dir * (towards - dv).max(self.crawl_speed());
            self.ramp = Some(Ramp::Decelerating);
        } else if towards < self.max_speed {
            let speed = (towards + dv).min(self.max_speed);
            self.speed = dir * speed;
            self.ramp = Some(if speed >= self.max_speed {
                Ramp::Cruising
            } else {
                Ramp::Accelerating
            });
        } else {
            self.speed = dir * self.max_speed;
            self.ramp = Some(Ramp::Cruising);
        }

        self.position += self.speed * dt;
        if self.speed * dir > 0.0 && (self.target as f64 - self.position) * dir < 0.5 {
            self.arrive();
        }
        self.position.round() as i64 - before
    }

    /// One deceleration increment without regard to the target
    pub fn brake(&mut self, dt: f64) -> i64 {
        let before = self.position.round() as i64;
        let magnitude = (self.speed.abs() - self.acceleration * dt).max(0.0);
        self.speed = self.speed.signum() * magnitude;
        self.position += self.speed * dt;
        self.ramp = Some(Ramp::Decelerating);
        self.position.round() as i64 - before
    }

    /// Zero speed, target pinned to the current position
    pub fn halt(&mut self) {
        self.position = self.position.round();
        self.target = self.position();
        self.speed = 0.0;
        self.ramp = None;
        self.braking = false;
    }

    fn arrive(&mut self) {
        self.position = self.target as f64;
        self.speed = 0.0;
        self.ramp = None;
        self.braking = false;
    }
}

#[derive(Debug, Clone, Copy)]
struct Endstop {
    pin: u8,
    active_low: bool,
}

#[derive(Debug)]
struct Axis {
    step_pin: u8,
    dir_pin: u8,
    enable_pin: Option<u8>,
    profile: Profile,
    action: Action,
    last_tick: u64,
    /// Level last written to the direction pin
    forward: Option<bool>,
    endstops: Vec<Endstop>,
    endstops_enabled: bool,
    prev_endstops: u8,
    debounce_until: u64,
}

impl Axis {
    fn new(step_pin: u8, dir_pin: u8, enable_pin: Option<u8>) -> Self {
        Axis {
            step_pin,
            dir_pin,
            enable_pin,
            profile: Profile::default(),
            action: Action::default(),
            last_tick: 0,
            forward: None,
            endstops: Vec::with_capacity(MAX_ENDSTOPS),
            endstops_enabled: false,
            prev_endstops: 0,
            debounce_until: 0,
        }
    }

    fn set_outputs<B: Board>(&self, board: &mut B, enabled: bool) -> Result<(), HardwareError> {
        match self.enable_pin {
            Some(pin) => board.digital_write(pin, enabled),
            None => Ok(()),
        }
    }

    /// Bit pattern of active endstops, the last added one is the LSB
    fn poll_endstops<B: Board>(&self, board: &mut B) -> Result<u8, HardwareError> {
        let mut bits = 0u8;
        for endstop in &self.endstops {
            let level = board.digital_read(endstop.pin)?;
            bits = bits << 1 | (level ^ endstop.active_low) as u8;
        }
        Ok(bits)
    }

    /// True on a debounced rising flank
    fn endstop_hit<B: Board>(&mut self, board: &mut B, now: u64, debounce: u64) -> Result<bool, HardwareError> {
        if !self.endstops_enabled || self.endstops.is_empty() {
            return Ok(false);
        }
        let bits = self.poll_endstops(board)?;
        if bits != self.prev_endstops && now >= self.debounce_until {
            self.debounce_until = now + debounce;
            self.prev_endstops = bits;
            return Ok(bits != 0);
        }
        Ok(false)
    }

    fn emit_steps<B: Board>(&mut self, steps: i64, board: &mut B) -> Result<(), HardwareError> {
        if steps == 0 {
            return Ok(());
        }
        let forward = steps > 0;
        if self.forward != Some(forward) {
            board.digital_write(self.dir_pin, forward)?;
            self.forward = Some(forward);
        }
        board.pulse(self.step_pin, steps.unsigned_abs().min(u32::MAX as u64) as u32)
    }

    fn finish<B: Board>(&mut self, unit: u8, stopped: bool, ctx: &mut ModuleContext<'_, B>) {
        if stopped {
            self.profile.halt();
        }
        self.action.complete(stopped);
        let reason = if stopped {
            EventReason::ActionStopped
        } else {
            EventReason::ActionCompleted
        };
        info!("stepper {} {} at {}", unit, if stopped { "stopped" } else { "reached target" }, self.profile.position());
        ctx.raise(reason, unit, self.profile.position());
    }

    fn fault<B: Board>(&mut self, unit: u8, reason: EventReason, ctx: &mut ModuleContext<'_, B>) {
        self.profile.halt();
        self.action.fault();
        ctx.raise(reason, unit, self.profile.position());
    }

    fn tick<B: Board>(&mut self, unit: u8, debounce: u64, ctx: &mut ModuleContext<'_, B>) {
        match self.action.phase() {
            ActionPhase::Armed => {
                if self.action.stop_requested() {
                    self.finish(unit, true, ctx);
                    return;
                }
                self.action.begin();
                self.last_tick = ctx.now;
                if let Err(e) = self.set_outputs(ctx.board, true) {
                    warn!("stepper {} failed to enable outputs: {}", unit, e);
                    self.fault(unit, EventReason::HardwareFault, ctx);
                }
                return;
            }
            ActionPhase::InProgress => {}
            _ => return,
        }

        let dt_ms = ctx.now.saturating_sub(self.last_tick).min(MAX_TICK_MS);
        self.last_tick = ctx.now;
        let dt = dt_ms as f64 / 1000.0;

        let stopping = self.action.stop_requested();
        let steps = if stopping {
            self.profile.brake(dt)
        } else {
            self.profile.advance(dt)
        };

        if let Err(e) = self.emit_steps(steps, ctx.board) {
            warn!("stepper {} faulted while stepping: {}", unit, e);
            self.fault(unit, EventReason::HardwareFault, ctx);
            return;
        }
        match self.endstop_hit(ctx.board, ctx.now, debounce) {
            Ok(true) => {
                warn!("stepper {} hit an endstop at {}", unit, self.profile.position());
                self.fault(unit, EventReason::EndstopHit, ctx);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("stepper {} failed to read endstops: {}", unit, e);
                self.fault(unit, EventReason::HardwareFault, ctx);
                return;
            }
        }

        if stopping {
            self.finish(unit, true, ctx);
        } else if self.profile.at_target() {
            self.finish(unit, false, ctx);
        }
    }

    fn start(&mut self, target: i32) -> Reply {
        self.profile.set_target(target);
        self.action.arm();
        debug!("stepper armed for target {}", target);
        Reply::accepted()
    }

    /// Disables the driver and returns every pin the axis used to input
    fn release<B: Board>(&mut self, board: &mut B) {
        if let Err(e) = self.set_outputs(board, false) {
            warn!("failed to disable stepper outputs: {}", e);
        }
        let outputs = [Some(self.step_pin), Some(self.dir_pin), self.enable_pin];
        let pins = outputs.into_iter().flatten().chain(self.endstops.iter().map(|e| e.pin));
        for pin in pins {
            if let Err(e) = board.pin_mode(pin, PinMode::Input) {
                warn!("failed to release stepper pin {}: {}", pin, e);
            }
        }
        self.forward = None;
    }
}

/// Up to `max_steppers` independently moving axes
#[derive(Debug)]
pub struct StepperModule {
    axes: Vec<Option<Axis>>,
    debounce_ms: u64,
}

impl StepperModule {
    pub fn new(max_steppers: usize, debounce_ms: u64) -> Self {
        StepperModule {
            axes: (0..max_steppers).map(|_| None).collect(),
            debounce_ms,
        }
    }

    /// Phase of a unit's current move, `None` if the unit is not attached
    pub fn phase(&self, unit: u8) -> Option<ActionPhase> {
        self.axes.get(unit as usize)?.as_ref().map(|axis| axis.action.phase())
    }

    /// Motion profile of a unit
    pub fn profile(&self, unit: u8) -> Option<&Profile> {
        self.axes.get(unit as usize)?.as_ref().map(|axis| &axis.profile)
    }

    fn attach<B: Board>(
        &mut self,
        step_pin: u8,
        dir_pin: u8,
        enable_pin: Option<u8>,
        board: &mut B,
    ) -> Result<Reply, CommandError> {
        if !self.axes.iter().any(Option::is_none) {
            return Err(CommandError::invalid("no free stepper unit"));
        }

        let pins = [Some(step_pin), Some(dir_pin), enable_pin];
        for pin in pins.into_iter().flatten() {
            board.check_pin(pin)?;
        }
        for pin in pins.into_iter().flatten() {
            board.pin_mode(pin, PinMode::Output)?;
        }
        let axis = Axis::new(step_pin, dir_pin, enable_pin);
        axis.set_outputs(board, true)?;

        let unit = allocate(&mut self.axes, axis)?;
        info!("stepper {} attached (step {}, dir {})", unit, step_pin, dir_pin);
        Ok(Reply::ok().u8(unit))
    }
}

fn positive(value: f32, what: &str) -> Result<f64, CommandError> {
    if value <= 0.0 {
        return Err(CommandError::invalid(format!("{} must be positive, got {}", what, value)));
    }
    Ok(value as f64)
}

impl ModuleHandler for StepperModule {
    const KIND: ModuleKind = ModuleKind::Stepper;

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
            let step_pin = args.u8()?;
            let dir_pin = args.u8()?;
            let enable_pin = match args.u8()? {
                NO_PIN => None,
                pin => Some(pin),
            };
            args.finish()?;
            return self.attach(step_pin, dir_pin, enable_pin, ctx.board);
        }

        let axis = unit_mut(&mut self.axes, command.unit)?;
        let reply = match command.command_id {
            cmd::START => {
                let target = args.i32()?;
                args.finish()?;
                axis.start(target)
            }
            cmd::MOVE => {
                let delta = args.i32()?;
                args.finish()?;
                let target = axis
                    .profile
                    .position()
                    .checked_add(delta)
                    .ok_or_else(|| CommandError::invalid("relative move overflows the position range"))?;
                axis.start(target)
            }
            cmd::STOP => {
                args.finish()?;
                if axis.action.request_stop() {
                    debug!("stepper {} stop requested", command.unit);
                    Reply::accepted()
                } else {
                    Reply::ok()
                }
            }
            cmd::SET_MAX_SPEED => {
                let speed = positive(args.f32()?, "max speed")?;
                args.finish()?;
                axis.profile.max_speed = speed;
                Reply::ok()
            }
            cmd::SET_ACCELERATION => {
                let acceleration = positive(args.f32()?, "acceleration")?;
                args.finish()?;
                axis.profile.acceleration = acceleration;
                Reply::ok()
            }
            cmd::CURRENT_POSITION => {
                args.finish()?;
                Reply::ok().i32(axis.profile.position())
            }
            cmd::SET_CURRENT_POSITION => {
                let position = args.i32()?;
                args.finish()?;
                if axis.action.is_active() {
                    return Err(CommandError::invalid("cannot set position while moving"));
                }
                axis.profile.set_position(position);
                Reply::ok()
            }
            cmd::DISTANCE_TO_GO => {
                args.finish()?;
                Reply::ok().i32(axis.profile.distance_to_go())
            }
            cmd::TARGET_POSITION => {
                args.finish()?;
                Reply::ok().i32(axis.profile.target())
            }
            cmd::SPEED => {
                args.finish()?;
                Reply::ok().f32(axis.profile.speed() as f32)
            }
            cmd::GET_STATE => {
                args.finish()?;
                Reply::ok().u8(axis.action.phase().code())
            }
            cmd::SET_ENDSTOP => {
                let pin = args.u8()?;
                let active_low = args.bool()?;
                let pullup = args.bool()?;
                args.finish()?;
                if axis.endstops.len() >= MAX_ENDSTOPS {
                    return Err(CommandError::invalid(format!(
                        "an axis takes at most {} endstops",
                        MAX_ENDSTOPS
                    )));
                }
                ctx.board.check_pin(pin)?;
                let mode = if pullup { PinMode::InputPullup } else { PinMode::Input };
                ctx.board.pin_mode(pin, mode)?;
                axis.endstops.push(Endstop { pin, active_low });
                if axis.endstops_enabled {
                    // The bit layout shifted, compare against the new one
                    axis.prev_endstops = axis.poll_endstops(ctx.board)?;
                }
                Reply::ok()
            }
            cmd::ENABLE_ENDSTOPS => {
                let enabled = args.bool()?;
                args.finish()?;
                if enabled {
                    // An endstop already active now must not fire at once
                    axis.prev_endstops = axis.poll_endstops(ctx.board)?;
                }
                axis.endstops_enabled = enabled;
                Reply::ok()
            }
            cmd::ENDSTOPS => {
                args.finish()?;
                Reply::ok().u8(axis.poll_endstops(ctx.board)?)
            }
            cmd::CLEAR => {
                args.finish()?;
                if !axis.action.clear() {
                    return Err(CommandError::invalid("cannot clear a move in progress"));
                }
                Reply::ok()
            }
            cmd::DETACH => {
                args.finish()?;
                if axis.action.is_active() {
                    axis.finish(command.unit, true, ctx);
                }
                axis.release(ctx.board);
                self.axes[command.unit as usize] = None;
                info!("stepper {} detached", command.unit);
                Reply::ok()
            }
            other => return Err(CommandError::UnknownCommand(other)),
        };
        Ok(reply)
    }

    fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        let debounce = self.debounce_ms;
        for (unit, slot) in self.axes.iter_mut().enumerate() {
            if let Some(axis) = slot {
                axis.tick(unit as u8, debounce, ctx);
            }
        }
    }

    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for slot in self.axes.iter_mut() {
            if let Some(mut axis) = slot.take() {
                axis.release(ctx.board);
            }
        }
    }
}
