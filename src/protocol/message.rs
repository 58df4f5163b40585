use bytes::Bytes;

use crate::core::{ModuleId, ModuleKind, StatusCode};

/// One decoded command addressed to a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    /// Target module slot
    pub module_id: ModuleId,
    /// Command id, private to the target module
    pub command_id: u8,
    /// Peripheral unit inside the module (axis, channel), 0 if unused
    pub unit: u8,
    /// Raw little-endian argument bytes
    pub args: Bytes,
}

impl CommandEnvelope {
    /// Creates a command without arguments for unit 0
    pub fn new(module_id: ModuleId, command_id: u8) -> Self {
        CommandEnvelope {
            module_id,
            command_id,
            unit: 0,
            args: Bytes::new(),
        }
    }

    /// Creates a command for one of the built-in module kinds
    pub fn to(kind: ModuleKind, command_id: u8) -> Self {
        Self::new(kind.id(), command_id)
    }

    /// Sets the addressed unit
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the argument bytes
    pub fn with_args(mut self, args: impl Into<Bytes>) -> Self {
        self.args = args.into();
        self
    }
}

/// The single reply produced for every command envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEnvelope {
    /// Outcome of the command
    pub status: StatusCode,
    /// Raw little-endian return bytes
    pub data: Bytes,
}

impl ResultEnvelope {
    /// Creates a result carrying only a status
    pub fn status(status: StatusCode) -> Self {
        ResultEnvelope {
            status,
            data: Bytes::new(),
        }
    }

    /// Creates an `Ok` result with return bytes
    pub fn ok(data: impl Into<Bytes>) -> Self {
        ResultEnvelope {
            status: StatusCode::Ok,
            data: data.into(),
        }
    }

    /// Returns true for `Ok` and `Accepted`
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
