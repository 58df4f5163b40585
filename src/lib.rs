//! perilink: command/response protocol engine for peripheral firmware
//!
//! A controller drives stepper motors, servos, pins, rotary encoders, analog
//! sensors and LED panels that live on a separate microcontroller reachable
//! only over a shared, message-oriented link. The firmware answers every
//! command at once and runs long actions (moves, sweeps) in the background,
//! reporting their outcome through a single polled event record.
pub mod controller;
pub mod core;
pub mod firmware;
pub mod hal;
pub mod modules;
pub mod protocol;
pub mod transport;

// Re-export commonly used items
pub use crate::controller::{AsyncController, Controller};
pub use crate::core::{ControllerConfig, Error, FirmwareConfig, ModuleId, ModuleKind, Result, StatusCode};
pub use crate::firmware::{Compatibility, EventReason, EventRecord, Firmware, VersionRecord};
pub use crate::protocol::{CommandEnvelope, ResultEnvelope};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
