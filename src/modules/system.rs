use tracing::{debug, info};

use crate::core::{CommandError, ModuleKind};
use crate::firmware::SignalLine;
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{ModuleContext, ModuleHandler};

/// Command ids of the system module
pub mod cmd {
    pub const RESET: u8 = 0;
    pub const SET_INTERRUPT_PIN: u8 = 1;
    pub const CLEAR_INTERRUPT: u8 = 2;
    pub const GET_VERSION: u8 = 3;
    pub const PING_BACK: u8 = 4;
    pub const GET_STATS: u8 = 5;
}

/// Firmware housekeeping: reset, interrupt line, version, link diagnostics
#[derive(Debug, Default)]
pub struct SystemModule;

impl SystemModule {
    pub fn new() -> Self {
        SystemModule
    }

    fn set_interrupt_pin<B: Board>(
        &mut self,
        pin: i8,
        active_high: bool,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        let line = if pin < 0 {
            None
        } else {
            ctx.board.check_pin(pin as u8)?;
            Some(SignalLine {
                pin: pin as u8,
                active_high,
            })
        };

        if let Some(previous) = ctx.events.signal_line() {
            ctx.board.pin_mode(previous.pin, PinMode::Input)?;
        }
        match line {
            Some(line) => {
                ctx.events.attach_signal_line(&mut *ctx.board, line)?;
                debug!("interrupt line on pin {} (active {})", line.pin, if active_high { "high" } else { "low" });
            }
            None => {
                ctx.events.set_signal_line(None);
                debug!("interrupt line disabled");
            }
        }
        Ok(Reply::ok())
    }
}

impl ModuleHandler for SystemModule {
    const KIND: ModuleKind = ModuleKind::System;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        let mut args = ArgReader::new(&command.args);
        match command.command_id {
            cmd::RESET => {
                args.finish()?;
                info!("reset requested");
                ctx.request_reset();
                Ok(Reply::ok())
            }
            cmd::SET_INTERRUPT_PIN => {
                let pin = args.i8()?;
                let active_high = args.bool()?;
                args.finish()?;
                self.set_interrupt_pin(pin, active_high, ctx)
            }
            cmd::CLEAR_INTERRUPT => {
                args.finish()?;
                let record = ctx.events.poll();
                Ok(Reply::ok().bytes(&record.to_bytes()))
            }
            cmd::GET_VERSION => {
                args.finish()?;
                Ok(Reply::ok().bytes(&ctx.version.to_bytes()))
            }
            cmd::PING_BACK => {
                let len = args.u8()? as usize;
                let data = args.bytes(len)?;
                args.finish()?;
                Ok(Reply::ok().bytes(data))
            }
            cmd::GET_STATS => {
                args.finish()?;
                Ok(Reply::ok()
                    .u32(ctx.stats.frames_received)
                    .u32(ctx.stats.frames_rejected)
                    .u32(ctx.stats.commands_dispatched))
            }
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    fn reset<B: Board>(&mut self, _ctx: &mut ModuleContext<'_, B>) {}
}
