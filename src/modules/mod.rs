//! Peripheral modules
//!
//! Each module owns the state of its units and handles the commands
//! addressed to its id. The firmware holds them in a fixed table of
//! [`Module`] values; there is no dynamic registration.

pub mod action;
pub mod display;
pub mod encoder;
pub mod pin;
pub mod sensor;
pub mod servo;
pub mod stepper;
pub mod system;

pub use self::action::{Action, ActionPhase};
pub use self::display::DisplayModule;
pub use self::encoder::EncoderModule;
pub use self::pin::PinModule;
pub use self::sensor::SensorModule;
pub use self::servo::ServoModule;
pub use self::stepper::StepperModule;
pub use self::system::SystemModule;

use crate::core::{CommandError, FirmwareConfig, ModuleId, ModuleKind};
use crate::firmware::{EventReason, EventReporter, LinkStats, VersionRecord};
use crate::hal::Board;
use crate::protocol::{CommandEnvelope, Reply};

/// Everything a handler or tick may touch besides its own state
pub struct ModuleContext<'a, B: Board> {
    pub board: &'a mut B,
    pub events: &'a mut EventReporter,
    pub version: &'a VersionRecord,
    /// Link counters as of the start of this dispatch
    pub stats: LinkStats,
    /// Id of the module being run
    pub module_id: ModuleId,
    /// Board time sampled once per dispatch or tick
    pub now: u64,
    reset_requested: bool,
}

impl<'a, B: Board> ModuleContext<'a, B> {
    pub fn new(
        board: &'a mut B,
        events: &'a mut EventReporter,
        version: &'a VersionRecord,
        stats: LinkStats,
        module_id: ModuleId,
    ) -> Self {
        let now = board.millis();
        ModuleContext {
            board,
            events,
            version,
            stats,
            module_id,
            now,
            reset_requested: false,
        }
    }

    /// Raises an event on behalf of the running module
    pub fn raise(&mut self, reason: EventReason, unit: u8, payload: i32) {
        self.events.raise(reason, self.module_id, unit, payload, self.now);
    }

    /// Asks the firmware to reset every module once this dispatch returns
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }
}

/// Behaviour shared by every module type
pub trait ModuleHandler {
    const KIND: ModuleKind;

    /// Validates and executes one command, never blocks on hardware
    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError>;

    /// Advances background actions by one bounded increment
    fn tick<B: Board>(&mut self, _ctx: &mut ModuleContext<'_, B>) {}

    /// Returns every unit to its power-on state
    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>);
}

/// One occupied slot of the module table
#[derive(Debug)]
pub enum Module {
    System(SystemModule),
    Stepper(StepperModule),
    Servo(ServoModule),
    Pin(PinModule),
    Encoder(EncoderModule),
    Sensor(SensorModule),
    Display(DisplayModule),
}

macro_rules! each_module {
    ($module:expr, $m:ident => $body:expr) => {
        match $module {
            Module::System($m) => $body,
            Module::Stepper($m) => $body,
            Module::Servo($m) => $body,
            Module::Pin($m) => $body,
            Module::Encoder($m) => $body,
            Module::Sensor($m) => $body,
            Module::Display($m) => $body,
        }
    };
}

impl Module {
    /// Builds a module of the given kind sized from the config
    pub fn new(kind: ModuleKind, config: &FirmwareConfig) -> Self {
        match kind {
            ModuleKind::System => Module::System(SystemModule::new()),
            ModuleKind::Stepper => Module::Stepper(StepperModule::new(
                config.max_steppers,
                config.endstop_debounce.as_millis() as u64,
            )),
            ModuleKind::Servo => Module::Servo(ServoModule::new(config.max_servos)),
            ModuleKind::Pin => Module::Pin(PinModule::new(config.max_watched_pins)),
            ModuleKind::Encoder => Module::Encoder(EncoderModule::new(config.max_encoders)),
            ModuleKind::Sensor => Module::Sensor(SensorModule::new(config.max_sensors)),
            ModuleKind::Display => Module::Display(DisplayModule::new(config.max_displays)),
        }
    }

    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::System(_) => SystemModule::KIND,
            Module::Stepper(_) => StepperModule::KIND,
            Module::Servo(_) => ServoModule::KIND,
            Module::Pin(_) => PinModule::KIND,
            Module::Encoder(_) => EncoderModule::KIND,
            Module::Sensor(_) => SensorModule::KIND,
            Module::Display(_) => DisplayModule::KIND,
        }
    }

    pub fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        each_module!(self, m => m.handle(command, ctx))
    }

    pub fn tick<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        each_module!(self, m => m.tick(ctx))
    }

    pub fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        each_module!(self, m => m.reset(ctx))
    }
}

/// Looks up a unit slot, `InvalidArgument` if out of range or empty
pub(crate) fn unit_mut<T>(units: &mut [Option<T>], unit: u8) -> Result<&mut T, CommandError> {
    units
        .get_mut(unit as usize)
        .and_then(Option::as_mut)
        .ok_or_else(|| CommandError::invalid(format!("unit {} is not attached", unit)))
}

/// Stores `value` in the first free slot and returns its index
pub(crate) fn allocate<T>(units: &mut [Option<T>], value: T) -> Result<u8, CommandError> {
    let index = units
        .iter()
        .position(Option::is_none)
        .ok_or_else(|| CommandError::invalid("no free unit"))?;
    units[index] = Some(value);
    Ok(index as u8)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::ModuleSet;
    use crate::hal::SimulatedBoard;

    /// Board, events and version for driving one module in isolation
    pub struct Bench {
        pub board: SimulatedBoard,
        pub events: EventReporter,
        pub version: VersionRecord,
    }

    impl Bench {
        pub fn new() -> Self {
            Bench {
                board: SimulatedBoard::new(20),
                events: EventReporter::new(),
                version: VersionRecord::current(ModuleSet::all()),
            }
        }

        pub fn ctx(&mut self, kind: ModuleKind) -> ModuleContext<'_, SimulatedBoard> {
            ModuleContext::new(
                &mut self.board,
                &mut self.events,
                &self.version,
                LinkStats::default(),
                kind.id(),
            )
        }

        pub fn call<M: ModuleHandler>(
            &mut self,
            module: &mut M,
            command_id: u8,
            unit: u8,
            args: &[u8],
        ) -> Result<Reply, CommandError> {
            let command = CommandEnvelope::to(M::KIND, command_id)
                .with_unit(unit)
                .with_args(args.to_vec());
            let mut ctx = self.ctx(M::KIND);
            module.handle(&command, &mut ctx)
        }

        pub fn tick<M: ModuleHandler>(&mut self, module: &mut M, advance_ms: u64) {
            self.board.advance(advance_ms);
            let mut ctx = self.ctx(M::KIND);
            module.tick(&mut ctx);
        }

        pub fn reset<M: ModuleHandler>(&mut self, module: &mut M) {
            let mut ctx = self.ctx(M::KIND);
            module.reset(&mut ctx);
        }
    }

    /// Return bytes of a successful reply
    pub fn data(reply: Reply) -> Vec<u8> {
        reply.into_result().data.to_vec()
    }
}
