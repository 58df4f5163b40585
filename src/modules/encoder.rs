//! Quadrature rotary encoders
//!
//! Both signal pins are sampled on every tick. The raw position counts every
//! quadrature transition; the reported position only moves when the signals
//! pass through the latch state(s) of the configured mode.

use tracing::{info, warn};

use crate::core::{CommandError, HardwareError, ModuleKind};
use crate::firmware::EventReason;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{allocate, unit_mut, ModuleContext, ModuleHandler};

/// Command ids of the encoder module
pub mod cmd {
    pub const ATTACH: u8 = 0;
    pub const GET_POSITION: u8 = 1;
    pub const GET_DIRECTION: u8 = 2;
    pub const SET_POSITION: u8 = 3;
    pub const MILLIS_BETWEEN_ROTATIONS: u8 = 4;
    pub const GET_RPM: u8 = 5;
}

/// Direction of travel for every (previous, current) signal pair
const KNOBDIR: [i32; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Detents per revolution assumed for RPM
const STEPS_PER_REVOLUTION: u64 = 20;

/// Which signal states count as a detent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LatchMode {
    /// Four steps per detent, latch at state 3
    Four3 = 0,
    /// Four steps per detent, latch at state 0
    Four0 = 1,
    /// Two steps per detent, latch at states 0 and 3
    Two03 = 2,
}

impl LatchMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LatchMode::Four3),
            1 => Some(LatchMode::Four0),
            2 => Some(LatchMode::Two03),
            _ => None,
        }
    }

    fn latches(self, state: u8) -> bool {
        match self {
            LatchMode::Four3 => state == 3,
            LatchMode::Four0 => state == 0,
            LatchMode::Two03 => state == 0 || state == 3,
        }
    }

    /// Raw transitions per reported step, as a shift
    fn shift(self) -> u32 {
        match self {
            LatchMode::Four3 | LatchMode::Four0 => 2,
            LatchMode::Two03 => 1,
        }
    }
}

#[derive(Debug)]
struct Encoder {
    pin1: u8,
    pin2: u8,
    mode: LatchMode,
    old_state: u8,
    raw: i32,
    position: i32,
    position_prev: i32,
    latched_at: u64,
    latched_at_prev: u64,
}

impl Encoder {
    fn sample<B: Board>(&self, board: &mut B) -> Result<u8, HardwareError> {
        let sig1 = board.digital_read(self.pin1)? as u8;
        let sig2 = board.digital_read(self.pin2)? as u8;
        Ok(sig1 | sig2 << 1)
    }

    fn update(&mut self, state: u8, now: u64) {
        if state == self.old_state {
            return;
        }
        self.raw = self
            .raw
            .wrapping_add(KNOBDIR[(state | self.old_state << 2) as usize]);
        self.old_state = state;
        if self.mode.latches(state) {
            self.position = self.raw >> self.mode.shift();
            self.latched_at_prev = self.latched_at;
            self.latched_at = now;
        }
    }

    /// -1, 0 or 1 since the last call
    fn direction(&mut self) -> i8 {
        let direction = match self.position_prev.cmp(&self.position) {
            std::cmp::Ordering::Greater => -1,
            std::cmp::Ordering::Less => 1,
            std::cmp::Ordering::Equal => 0,
        };
        self.position_prev = self.position;
        direction
    }

    fn set_position(&mut self, position: i32) {
        let shift = self.mode.shift();
        let mask = (1 << shift) - 1;
        self.raw = position.wrapping_shl(shift) | (self.raw & mask);
        self.position = position;
        self.position_prev = position;
    }

    fn millis_between_rotations(&self) -> u64 {
        self.latched_at - self.latched_at_prev
    }

    fn rpm(&self, now: u64) -> u32 {
        let between = self.millis_between_rotations();
        let since_last = now.saturating_sub(self.latched_at);
        let period = between.max(since_last);
        if period == 0 {
            return 0;
        }
        (60_000 / (period * STEPS_PER_REVOLUTION)) as u32
    }
}

/// Up to `max_encoders` quadrature decoders
#[derive(Debug)]
pub struct EncoderModule {
    encoders: Vec<Option<Encoder>>,
}

impl EncoderModule {
    pub fn new(max_encoders: usize) -> Self {
        EncoderModule {
            encoders: (0..max_encoders).map(|_| None).collect(),
        }
    }

    /// Reported position of a unit
    pub fn position(&self, unit: u8) -> Option<i32> {
        self.encoders.get(unit as usize)?.as_ref().map(|encoder| encoder.position)
    }

    fn attach<B: Board>(&mut self, pin1: u8, pin2: u8, mode: LatchMode, now: u64, board: &mut B) -> Result<Reply, CommandError> {
        if !self.encoders.iter().any(Option::is_none) {
            return Err(CommandError::invalid("no free encoder unit"));
        }
        board.check_pin(pin1)?;
        board.check_pin(pin2)?;
        board.pin_mode(pin1, PinMode::InputPullup)?;
        board.pin_mode(pin2, PinMode::InputPullup)?;

        let mut encoder = Encoder {
            pin1,
            pin2,
            mode,
            old_state: 0,
            raw: 0,
            position: 0,
            position_prev: 0,
            latched_at: now,
            latched_at_prev: now,
        };
        encoder.old_state = encoder.sample(board)?;
        let unit = allocate(&mut self.encoders, encoder)?;
        info!("encoder {} attached on pins {}/{} ({:?})", unit, pin1, pin2, mode);
        Ok(Reply::ok().u8(unit))
    }
}

impl ModuleHandler for EncoderModule {
    const KIND: ModuleKind = ModuleKind::Encoder;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        if command.command_id > cmd::GET_RPM {
            return Err(CommandError::UnknownCommand(command.command_id));
        }
        let mut args = ArgReader::new(&command.args);
        if command.command_id == cmd::ATTACH {
            let pin1 = args.u8()?;
            let pin2 = args.u8()?;
            let raw = args.u8()?;
            args.finish()?;
            let mode = LatchMode::from_u8(raw)
                .ok_or_else(|| CommandError::invalid(format!("unknown latch mode {}", raw)))?;
            return self.attach(pin1, pin2, mode, ctx.now, ctx.board);
        }

        let encoder = unit_mut(&mut self.encoders, command.unit)?;
        match command.command_id {
            cmd::GET_POSITION => {
                args.finish()?;
                Ok(Reply::ok().i32(encoder.position))
            }
            cmd::GET_DIRECTION => {
                args.finish()?;
                Ok(Reply::ok().i8(encoder.direction()))
            }
            cmd::SET_POSITION => {
                let position = args.i32()?;
                args.finish()?;
                encoder.set_position(position);
                Ok(Reply::ok())
            }
            cmd::MILLIS_BETWEEN_ROTATIONS => {
                args.finish()?;
                let millis = encoder.millis_between_rotations().min(u32::MAX as u64) as u32;
                Ok(Reply::ok().u32(millis))
            }
            cmd::GET_RPM => {
                args.finish()?;
                Ok(Reply::ok().u32(encoder.rpm(ctx.now)))
            }
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for (unit, slot) in self.encoders.iter_mut().enumerate() {
            let Some(encoder) = slot.as_mut() else { continue };
            match encoder.sample(ctx.board) {
                Ok(state) => encoder.update(state, ctx.now),
                Err(e) => {
                    warn!("encoder {} detached after read failure: {}", unit, e);
                    ctx.raise(EventReason::HardwareFault, unit as u8, encoder.position);
                    *slot = None;
                }
            }
        }
    }

    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for slot in self.encoders.iter_mut() {
            if let Some(encoder) = slot.take() {
                for pin in [encoder.pin1, encoder.pin2] {
                    if let Err(e) = ctx.board.pin_mode(pin, PinMode::Input) {
                        warn!("failed to release encoder pin {}: {}", pin, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{data, Bench};

    const A: u8 = 2;
    const B: u8 = 3;

    /// Signal levels (pin A, pin B) for one clockwise detent starting at state 3
    const CW: [(bool, bool); 4] = [(false, true), (false, false), (true, false), (true, true)];

    fn attached(mode: u8) -> (Bench, EncoderModule) {
        let mut bench = Bench::new();
        let mut encoders = EncoderModule::new(2);
        let reply = bench.call(&mut encoders, cmd::ATTACH, 0, &[A, B, mode]).unwrap();
        assert_eq!(data(reply), vec![0]);
        (bench, encoders)
    }

    fn turn(bench: &mut Bench, encoders: &mut EncoderModule, steps: &[(bool, bool)]) {
        for &(a, b) in steps {
            bench.board.set_level(A, a);
            bench.board.set_level(B, b);
            bench.tick(encoders, 5);
        }
    }

    fn reversed() -> Vec<(bool, bool)> {
        let mut steps: Vec<_> = CW[..3].iter().rev().copied().collect();
        steps.push((true, true));
        steps
    }

    #[test]
    fn test_one_detent_per_four_transitions() {
        // Pull-ups idle both signals high: state 3
        let (mut bench, mut encoders) = attached(0);

        turn(&mut bench, &mut encoders, &CW);
        let first = encoders.position(0).unwrap();
        assert_eq!(first.abs(), 1);

        turn(&mut bench, &mut encoders, &CW);
        assert_eq!(encoders.position(0), Some(first * 2));

        let direction = data(bench.call(&mut encoders, cmd::GET_DIRECTION, 0, &[]).unwrap());
        assert_eq!(direction, vec![first.signum() as i8 as u8]);
        // Direction is relative to the previous query
        let direction = data(bench.call(&mut encoders, cmd::GET_DIRECTION, 0, &[]).unwrap());
        assert_eq!(direction, vec![0]);

        turn(&mut bench, &mut encoders, &reversed());
        assert_eq!(encoders.position(0), Some(first));
    }

    #[test]
    fn test_two_step_mode_counts_twice() {
        let (mut bench, mut encoders) = attached(2);
        turn(&mut bench, &mut encoders, &CW);
        assert_eq!(encoders.position(0).unwrap().abs(), 2);
    }

    #[test]
    fn test_set_position() {
        let (mut bench, mut encoders) = attached(0);
        bench
            .call(&mut encoders, cmd::SET_POSITION, 0, &(-40i32).to_le_bytes())
            .unwrap();
        let position = data(bench.call(&mut encoders, cmd::GET_POSITION, 0, &[]).unwrap());
        assert_eq!(position, (-40i32).to_le_bytes().to_vec());

        turn(&mut bench, &mut encoders, &CW);
        assert_eq!(encoders.position(0).unwrap().abs_diff(-40), 1);
    }

    #[test]
    fn test_rotation_timing() {
        let (mut bench, mut encoders) = attached(0);
        turn(&mut bench, &mut encoders, &CW);
        turn(&mut bench, &mut encoders, &CW);

        // Four ticks of 5 ms per detent
        let millis = data(bench.call(&mut encoders, cmd::MILLIS_BETWEEN_ROTATIONS, 0, &[]).unwrap());
        assert_eq!(millis, 20u32.to_le_bytes().to_vec());

        // 60000 / (20 ms * 20 steps)
        let rpm = data(bench.call(&mut encoders, cmd::GET_RPM, 0, &[]).unwrap());
        assert_eq!(rpm, 150u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_attach_validation() {
        let mut bench = Bench::new();
        let mut encoders = EncoderModule::new(1);
        let err = bench.call(&mut encoders, cmd::ATTACH, 0, &[A, B, 9]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));

        bench.call(&mut encoders, cmd::ATTACH, 0, &[A, B, 1]).unwrap();
        let err = bench.call(&mut encoders, cmd::ATTACH, 0, &[4, 5, 1]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));

        let err = bench.call(&mut encoders, cmd::GET_POSITION, 3, &[]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
    }

    #[test]
    fn test_read_failure_detaches() {
        let (mut bench, mut encoders) = attached(0);
        bench.board.inject_fault(A, "cable pulled");
        bench.tick(&mut encoders, 5);
        assert_eq!(encoders.position(0), None);
        assert_eq!(bench.events.poll().reason, EventReason::HardwareFault);

        bench.board.clear_fault(A);
        bench.reset(&mut encoders);
        assert_eq!(bench.board.mode(B), Some(PinMode::InputPullup));
    }
}
