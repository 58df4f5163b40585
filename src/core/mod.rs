//! Core types and traits for perilink
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{CommandError, DecodeError, Error, HardwareError, Result};
pub use self::types::{
    ControllerConfig,
    FirmwareConfig,
    ModuleId,
    ModuleKind,
    ModuleSet,
    StatusCode,
};

/// Protocol version, major part
pub const PROTOCOL_VERSION_MAJOR: u8 = 0;

/// Protocol version, minor part
pub const PROTOCOL_VERSION_MINOR: u8 = 3;

/// Protocol version, patch part
pub const PROTOCOL_VERSION_PATCH: u8 = 0;

/// Default payload ceiling for arguments and return bytes
pub const DEFAULT_MAX_BUFFER: usize = 64;

/// Hard upper bound any configured payload ceiling must respect
pub const MAX_FRAME_CAPACITY: usize = 1024;

/// Number of slots in the module table
pub const MAX_MODULES: usize = 16;
