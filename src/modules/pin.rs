use tracing::{debug, warn};

use crate::core::{CommandError, ModuleKind};
use crate::firmware::EventReason;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{ModuleContext, ModuleHandler};

/// Command ids of the pin module
pub mod cmd {
    pub const MODE: u8 = 0;
    pub const DIGITAL_READ: u8 = 1;
    pub const DIGITAL_WRITE: u8 = 2;
    pub const ANALOG_READ: u8 = 3;
    pub const ANALOG_WRITE: u8 = 4;
    pub const WATCH: u8 = 5;
    pub const UNWATCH: u8 = 6;
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    pin: u8,
    /// Edge that raises the event, falling when false
    rising: bool,
    last: bool,
}

/// Raw digital and analog access plus edge watches
#[derive(Debug)]
pub struct PinModule {
    /// Pins this module changed, returned to input on reset
    touched: Vec<u8>,
    watches: Vec<Watch>,
    max_watches: usize,
}

impl PinModule {
    pub fn new(max_watches: usize) -> Self {
        PinModule {
            touched: Vec::new(),
            watches: Vec::with_capacity(max_watches),
            max_watches,
        }
    }

    pub fn watched(&self) -> impl Iterator<Item = u8> + '_ {
        self.watches.iter().map(|watch| watch.pin)
    }

    fn touch(&mut self, pin: u8) {
        if !self.touched.contains(&pin) {
            self.touched.push(pin);
        }
    }

    fn watch<B: Board>(&mut self, pin: u8, rising: bool, board: &mut B) -> Result<(), CommandError> {
        board.check_pin(pin)?;
        let level = board.digital_read(pin)?;
        if let Some(watch) = self.watches.iter_mut().find(|watch| watch.pin == pin) {
            watch.rising = rising;
            watch.last = level;
            return Ok(());
        }
        if self.watches.len() >= self.max_watches {
            return Err(CommandError::invalid(format!(
                "at most {} pins can be watched",
                self.max_watches
            )));
        }
        self.watches.push(Watch { pin, rising, last: level });
        debug!("watching pin {} for {} edges", pin, if rising { "rising" } else { "falling" });
        Ok(())
    }
}

impl ModuleHandler for PinModule {
    const KIND: ModuleKind = ModuleKind::Pin;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        if command.command_id > cmd::UNWATCH {
            return Err(CommandError::UnknownCommand(command.command_id));
        }
        let mut args = ArgReader::new(&command.args);
        let pin = args.u8()?;
        match command.command_id {
            cmd::MODE => {
                let raw = args.u8()?;
                args.finish()?;
                let mode = PinMode::from_u8(raw)
                    .ok_or_else(|| CommandError::invalid(format!("unknown pin mode {}", raw)))?;
                ctx.board.pin_mode(pin, mode)?;
                self.touch(pin);
                Ok(Reply::ok())
            }
            cmd::DIGITAL_READ => {
                args.finish()?;
                Ok(Reply::ok().bool(ctx.board.digital_read(pin)?))
            }
            cmd::DIGITAL_WRITE => {
                let high = args.bool()?;
                args.finish()?;
                ctx.board.digital_write(pin, high)?;
                self.touch(pin);
                Ok(Reply::ok())
            }
            cmd::ANALOG_READ => {
                args.finish()?;
                Ok(Reply::ok().u16(ctx.board.analog_read(pin)?))
            }
            cmd::ANALOG_WRITE => {
                let value = args.u16()?;
                args.finish()?;
                ctx.board.analog_write(pin, value)?;
                self.touch(pin);
                Ok(Reply::ok())
            }
            cmd::WATCH => {
                let rising = args.bool()?;
                args.finish()?;
                self.watch(pin, rising, ctx.board)?;
                Ok(Reply::ok())
            }
            cmd::UNWATCH => {
                args.finish()?;
                let before = self.watches.len();
                self.watches.retain(|watch| watch.pin != pin);
                if self.watches.len() == before {
                    return Err(CommandError::invalid(format!("pin {} is not watched", pin)));
                }
                Ok(Reply::ok())
            }
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        let mut failed = Vec::new();
        for watch in self.watches.iter_mut() {
            let level = match ctx.board.digital_read(watch.pin) {
                Ok(level) => level,
                Err(e) => {
                    warn!("dropping watch on pin {}: {}", watch.pin, e);
                    failed.push(watch.pin);
                    continue;
                }
            };
            let edge = level != watch.last && level == watch.rising;
            watch.last = level;
            if edge {
                ctx.raise(EventReason::ExternalInterrupt, 0, watch.pin as i32);
            }
        }
        for pin in failed {
            self.watches.retain(|watch| watch.pin != pin);
            ctx.raise(EventReason::HardwareFault, 0, pin as i32);
        }
    }

    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        self.watches.clear();
        for pin in self.touched.drain(..) {
            if let Err(e) = ctx.board.pin_mode(pin, PinMode::Input) {
                warn!("failed to reset pin {}: {}", pin, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatusCode;
    use crate::modules::test_support::{data, Bench};

    #[test]
    fn test_digital_and_analog_io() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);

        bench.call(&mut pins, cmd::MODE, 0, &[13, 1]).unwrap();
        bench.call(&mut pins, cmd::DIGITAL_WRITE, 0, &[13, 1]).unwrap();
        assert!(bench.board.level(13));
        assert_eq!(data(bench.call(&mut pins, cmd::DIGITAL_READ, 0, &[13]).unwrap()), vec![1]);

        bench.board.set_analog_input(14, 812);
        let value = data(bench.call(&mut pins, cmd::ANALOG_READ, 0, &[14]).unwrap());
        assert_eq!(value, 812u16.to_le_bytes().to_vec());

        bench.call(&mut pins, cmd::ANALOG_WRITE, 0, &[6, 0x80, 0]).unwrap();
        assert_eq!(bench.board.analog_output(6), 128);
    }

    #[test]
    fn test_invalid_arguments() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);

        let err = bench.call(&mut pins, cmd::MODE, 0, &[13, 7]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));

        let err = bench.call(&mut pins, cmd::DIGITAL_READ, 0, &[99]).unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidArgument);

        let err = bench.call(&mut pins, cmd::DIGITAL_READ, 0, &[]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));

        let err = bench.call(&mut pins, cmd::UNWATCH, 0, &[3]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));

        bench.board.inject_fault(8, "shorted");
        let err = bench.call(&mut pins, cmd::DIGITAL_WRITE, 0, &[8, 1]).unwrap_err();
        assert_eq!(err.status(), StatusCode::HardwareFault);
    }

    #[test]
    fn test_watch_raises_on_chosen_edge() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);
        bench.call(&mut pins, cmd::WATCH, 0, &[10, 1]).unwrap();

        bench.tick(&mut pins, 1);
        assert!(bench.events.peek().is_none());

        bench.board.set_level(10, true);
        bench.tick(&mut pins, 1);
        let record = bench.events.poll();
        assert_eq!(record.reason, EventReason::ExternalInterrupt);
        assert_eq!(record.module_id, ModuleKind::Pin.id());
        assert_eq!(record.payload, 10);

        // Falling edge is ignored for a rising watch
        bench.board.set_level(10, false);
        bench.tick(&mut pins, 1);
        assert!(bench.events.peek().is_none());

        bench.call(&mut pins, cmd::UNWATCH, 0, &[10]).unwrap();
        bench.board.set_level(10, true);
        bench.tick(&mut pins, 1);
        assert!(bench.events.peek().is_none());
    }

    #[test]
    fn test_watch_limit() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);
        bench.call(&mut pins, cmd::WATCH, 0, &[1, 1]).unwrap();
        bench.call(&mut pins, cmd::WATCH, 0, &[2, 0]).unwrap();
        // Re-watching updates in place
        bench.call(&mut pins, cmd::WATCH, 0, &[2, 1]).unwrap();
        let err = bench.call(&mut pins, cmd::WATCH, 0, &[3, 1]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        assert_eq!(pins.watched().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_faulted_watch_is_dropped() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);
        bench.call(&mut pins, cmd::WATCH, 0, &[4, 1]).unwrap();
        bench.board.inject_fault(4, "open circuit");
        bench.tick(&mut pins, 1);

        assert_eq!(bench.events.poll().reason, EventReason::HardwareFault);
        assert_eq!(pins.watched().count(), 0);
    }

    #[test]
    fn test_reset_returns_pins_to_input() {
        let mut bench = Bench::new();
        let mut pins = PinModule::new(2);
        bench.call(&mut pins, cmd::MODE, 0, &[5, 1]).unwrap();
        bench.call(&mut pins, cmd::WATCH, 0, &[6, 1]).unwrap();

        bench.reset(&mut pins);
        assert_eq!(bench.board.mode(5), Some(PinMode::Input));
        assert_eq!(pins.watched().count(), 0);
    }
}
