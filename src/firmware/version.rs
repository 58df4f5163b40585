use crate::core::{
    ModuleSet, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, PROTOCOL_VERSION_PATCH,
};

/// Wire length of an encoded [`VersionRecord`]
pub const VERSION_RECORD_LEN: usize = 5;

/// Protocol version and module set, fixed at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    /// Modules compiled into the firmware
    pub modules: ModuleSet,
}

/// How a firmware's version relates to what a controller expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Exact,
    /// Same major, later minor/patch
    FirmwareNewer,
    /// Same major, earlier minor/patch; some commands may be missing
    FirmwareOlder,
    MajorMismatch,
    /// Expected modules the firmware was built without
    MissingModules(ModuleSet),
}

impl VersionRecord {
    /// The version this crate speaks, with the given module set
    pub fn current(modules: ModuleSet) -> Self {
        VersionRecord {
            major: PROTOCOL_VERSION_MAJOR,
            minor: PROTOCOL_VERSION_MINOR,
            patch: PROTOCOL_VERSION_PATCH,
            modules,
        }
    }

    /// `major << 16 | minor << 8 | patch`
    pub fn packed(&self) -> u32 {
        (self.major as u32) << 16 | (self.minor as u32) << 8 | self.patch as u32
    }

    /// Wire form: `major | minor | patch | modules:u16 LE`
    pub fn to_bytes(&self) -> [u8; VERSION_RECORD_LEN] {
        let modules = self.modules.0.to_le_bytes();
        [self.major, self.minor, self.patch, modules[0], modules[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < VERSION_RECORD_LEN {
            return None;
        }
        Some(VersionRecord {
            major: bytes[0],
            minor: bytes[1],
            patch: bytes[2],
            modules: ModuleSet(u16::from_le_bytes([bytes[3], bytes[4]])),
        })
    }

    /// Compares this (firmware) record against a controller's expectation
    ///
    /// Reports facts only; deciding whether to proceed is up to the caller.
    pub fn compare(&self, expected: &VersionRecord) -> Compatibility {
        if self.major != expected.major {
            return Compatibility::MajorMismatch;
        }
        let missing = expected.modules.difference(self.modules);
        if !missing.is_empty() {
            return Compatibility::MissingModules(missing);
        }
        match (self.minor, self.patch).cmp(&(expected.minor, expected.patch)) {
            std::cmp::Ordering::Equal => Compatibility::Exact,
            std::cmp::Ordering::Greater => Compatibility::FirmwareNewer,
            std::cmp::Ordering::Less => Compatibility::FirmwareOlder,
        }
    }
}
