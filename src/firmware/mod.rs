//! Firmware side of the link
//!
//! [`Firmware`] owns the board, the transport, the module table and the
//! event slot. Each loop iteration takes at most one frame, dispatches it,
//! then gives every module one bounded tick and updates the signal line.
//! Nothing in the loop blocks on hardware.

mod events;
mod registry;
mod version;

pub use self::events::{EventReason, EventRecord, EventReporter, SignalLine, EVENT_RECORD_LEN};
pub use self::registry::ModuleRegistry;
pub use self::version::{Compatibility, VersionRecord, VERSION_RECORD_LEN};

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use crate::core::{DecodeError, FirmwareConfig, ModuleKind, Result, StatusCode};
use crate::hal::Board;
use crate::modules::ModuleContext;
use crate::protocol::{decode_command, encode_result, CommandEnvelope, ResultEnvelope};
use crate::transport::Transport;

/// Counters describing traffic seen by the firmware since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames taken off the transport
    pub frames_received: u32,
    /// Frames that failed to decode
    pub frames_rejected: u32,
    /// Commands handed to a registered module
    pub commands_dispatched: u32,
}

/// A running firmware instance
pub struct Firmware<B: Board, T: Transport> {
    config: FirmwareConfig,
    board: B,
    transport: T,
    registry: ModuleRegistry,
    events: EventReporter,
    version: VersionRecord,
    stats: LinkStats,
}

impl<B: Board, T: Transport> Firmware<B, T> {
    /// Builds the module table from `config`
    pub fn new(config: FirmwareConfig, board: B, transport: T) -> Result<Self> {
        config.validate()?;
        let registry = ModuleRegistry::from_config(&config);
        let version = VersionRecord::current(registry.modules());
        info!(
            "firmware {}.{}.{} up, modules {:#06x}, {} pins, max payload {}",
            version.major,
            version.minor,
            version.patch,
            version.modules.0,
            board.pin_count(),
            config.max_buffer
        );
        Ok(Firmware {
            config,
            board,
            transport,
            registry,
            events: EventReporter::new(),
            version,
            stats: LinkStats::default(),
        })
    }

    /// Routes one command to its module and builds the reply
    pub fn dispatch(&mut self, command: &CommandEnvelope) -> ResultEnvelope {
        let Some(module) = self.registry.get_mut(command.module_id) else {
            debug!("no module under id {}", command.module_id);
            return ResultEnvelope::status(StatusCode::UnknownModule);
        };
        self.stats.commands_dispatched = self.stats.commands_dispatched.wrapping_add(1);

        let mut ctx = ModuleContext::new(
            &mut self.board,
            &mut self.events,
            &self.version,
            self.stats,
            command.module_id,
        );
        let outcome = module.handle(command, &mut ctx);
        let reset_requested = ctx.reset_requested();

        let result = match outcome {
            Ok(reply) if reply.len() > self.config.max_buffer => {
                warn!(
                    "{} command {} produced {} return bytes, limit is {}",
                    command.module_id,
                    command.command_id,
                    reply.len(),
                    self.config.max_buffer
                );
                ResultEnvelope::status(StatusCode::InvalidArgument)
            }
            Ok(reply) => reply.into_result(),
            Err(e) => {
                debug!("{} command {} unit {} refused: {}", command.module_id, command.command_id, command.unit, e);
                ResultEnvelope::status(e.status())
            }
        };
        trace!("{} command {} -> {:?}", command.module_id, command.command_id, result.status);

        if reset_requested {
            self.reset();
        }
        result
    }

    /// Decodes one frame and dispatches it
    ///
    /// A frame that fails to decode is never dispatched; it raises
    /// `MalformedFrame` and is answered with `InvalidArgument`.
    pub fn process_frame(&mut self, frame: &[u8]) -> ResultEnvelope {
        self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
        match decode_command(frame, self.config.max_buffer) {
            Ok(command) => self.dispatch(&command),
            Err(e) => {
                warn!("rejecting frame of {} bytes: {}", frame.len(), e);
                self.stats.frames_rejected = self.stats.frames_rejected.wrapping_add(1);
                let payload = match e {
                    DecodeError::Oversize { declared, .. } => declared,
                    DecodeError::Truncated { available, .. } => available,
                    DecodeError::UnknownStatus(raw) => raw as usize,
                };
                let now = self.board.millis();
                self.events.raise(
                    EventReason::MalformedFrame,
                    ModuleKind::System.id(),
                    0,
                    payload as i32,
                    now,
                );
                ResultEnvelope::status(StatusCode::InvalidArgument)
            }
        }
    }

    /// Advances every module's background actions by one increment
    pub fn tick(&mut self) {
        for (id, module) in self.registry.iter_mut() {
            let mut ctx = ModuleContext::new(&mut self.board, &mut self.events, &self.version, self.stats, id);
            module.tick(&mut ctx);
        }
    }

    /// Returns every module to its power-on state and clears the event slot
    ///
    /// The signal line configuration survives; it is released once the
    /// cleared slot is synced.
    pub fn reset(&mut self) {
        info!("resetting all modules");
        for (id, module) in self.registry.iter_mut() {
            let mut ctx = ModuleContext::new(&mut self.board, &mut self.events, &self.version, self.stats, id);
            module.reset(&mut ctx);
        }
        self.events.clear();
    }

    /// One loop iteration, returns true if a frame was handled
    ///
    /// Modules are ticked even when the transport fails; the transport
    /// error is returned after the tick.
    pub fn run_once(&mut self) -> Result<bool> {
        let received = self.receive_and_reply();
        self.service();
        received
    }

    fn receive_and_reply(&mut self) -> Result<bool> {
        let Some(frame) = self.transport.receive_available()? else {
            return Ok(false);
        };
        let result = self.process_frame(&frame);
        let mut out = BytesMut::new();
        encode_result(&result, &mut out);
        self.transport.send(&out)?;
        Ok(true)
    }

    /// Ticks every module, then drives the signal line
    ///
    /// For hosts that receive frames on their own and call
    /// [`dispatch`](Self::dispatch) directly.
    pub fn service(&mut self) {
        self.tick();
        if let Err(e) = self.events.sync_signal(&mut self.board) {
            warn!("failed to drive signal line: {}", e);
        }
    }

    /// Runs the loop until `running` is cleared
    ///
    /// Transport errors are logged and the loop keeps going.
    pub fn run(&mut self, running: &AtomicBool) {
        info!("firmware loop started");
        while running.load(Ordering::Relaxed) {
            match self.run_once() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(self.config.idle_interval),
                Err(e) => {
                    error!("loop iteration failed: {}", e);
                    std::thread::sleep(self.config.idle_interval);
                }
            }
        }
        info!("firmware loop stopped");
    }

    pub fn config(&self) -> &FirmwareConfig {
        &self.config
    }

    pub fn events(&self) -> &EventReporter {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventReporter {
        &mut self.events
    }

    pub fn version(&self) -> &VersionRecord {
        &self.version
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }
}
