use std::io;
use thiserror::Error;

use super::types::StatusCode;

/// Custom error types for perilink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }
}

/// Failure to turn bytes into an envelope
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes available than the header or declared length requires
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Declared payload length exceeds the buffer capacity
    #[error("declared length {declared} exceeds buffer capacity {max}")]
    Oversize { declared: usize, max: usize },

    /// Result frame carries a status byte outside the shared enumeration
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
}

/// Errors reported by a [`Board`](crate::hal::Board)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("pin {pin} out of range (board has {count} pins)")]
    PinOutOfRange { pin: u8, count: u8 },

    #[error("pin {0} is unavailable")]
    PinUnavailable(u8),

    #[error("hardware fault on pin {pin}: {reason}")]
    Fault { pin: u8, reason: String },
}

/// Why a module handler refused a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0}")]
    UnknownCommand(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl CommandError {
    /// Creates a new invalid argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        CommandError::InvalidArgument(msg.into())
    }

    /// Status code reported to the controller for this error
    pub fn status(&self) -> StatusCode {
        match self {
            CommandError::UnknownCommand(_) => StatusCode::UnknownCommand,
            CommandError::InvalidArgument(_) => StatusCode::InvalidArgument,
            CommandError::Hardware(HardwareError::PinOutOfRange { .. }) => StatusCode::InvalidArgument,
            CommandError::Hardware(_) => StatusCode::HardwareFault,
        }
    }
}
