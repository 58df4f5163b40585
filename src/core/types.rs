use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Identifies a module slot in the firmware's fixed module table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u8);

impl ModuleId {
    /// Returns the raw table index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ModuleKind::from_id(*self) {
            Some(kind) => write!(f, "{}({})", kind.name(), self.0),
            None => write!(f, "module({})", self.0),
        }
    }
}

/// The closed set of peripheral module types a firmware build can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModuleKind {
    /// Firmware housekeeping: reset, interrupts, version, diagnostics
    System = 0,
    /// Stepper motor axes with background motion profiles
    Stepper = 1,
    /// Hobby servos with background sweeps
    Servo = 2,
    /// Raw digital and analog pins
    Pin = 3,
    /// Quadrature rotary encoders
    Encoder = 4,
    /// Analog sensor channels with threshold events
    Sensor = 5,
    /// LED and 7-segment panels with keys
    Display = 6,
}

impl ModuleKind {
    /// Every module kind, in id order
    pub const ALL: [ModuleKind; 7] = [
        ModuleKind::System,
        ModuleKind::Stepper,
        ModuleKind::Servo,
        ModuleKind::Pin,
        ModuleKind::Encoder,
        ModuleKind::Sensor,
        ModuleKind::Display,
    ];

    /// Module id this kind is registered under
    pub fn id(self) -> ModuleId {
        ModuleId(self as u8)
    }

    /// Looks up the kind registered under an id
    pub fn from_id(id: ModuleId) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.id() == id)
    }

    /// Short lowercase name used in logs
    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::System => "system",
            ModuleKind::Stepper => "stepper",
            ModuleKind::Servo => "servo",
            ModuleKind::Pin => "pin",
            ModuleKind::Encoder => "encoder",
            ModuleKind::Sensor => "sensor",
            ModuleKind::Display => "display",
        }
    }
}

/// Bitset of module ids, bit `n` set when module id `n` is present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleSet(pub u16);

impl ModuleSet {
    /// Empty set
    pub fn empty() -> Self {
        ModuleSet(0)
    }

    /// Every module kind this crate implements
    pub fn all() -> Self {
        ModuleKind::ALL.iter().fold(ModuleSet::empty(), |set, kind| set.with(*kind))
    }

    /// Returns a copy of the set with `kind` added
    pub fn with(self, kind: ModuleKind) -> Self {
        ModuleSet(self.0 | 1 << kind as u8)
    }

    /// Returns true if `kind` is in the set
    pub fn contains(&self, kind: ModuleKind) -> bool {
        self.0 & (1 << kind as u8) != 0
    }

    /// Modules present in `self` but missing from `other`
    pub fn difference(&self, other: ModuleSet) -> ModuleSet {
        ModuleSet(self.0 & !other.0)
    }

    /// Returns true if no bit is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates over the known module kinds in the set
    pub fn kinds(&self) -> impl Iterator<Item = ModuleKind> + '_ {
        ModuleKind::ALL.iter().copied().filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<ModuleKind> for ModuleSet {
    fn from_iter<I: IntoIterator<Item = ModuleKind>>(iter: I) -> Self {
        iter.into_iter().fold(ModuleSet::empty(), |set, kind| set.with(kind))
    }
}

/// Outcome reported for every command, shared by all modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    /// Synchronous command completed
    Ok = 0,
    /// Background action armed; completion is reported through the event record
    Accepted = 1,
    /// No module is registered under the addressed id
    UnknownModule = 2,
    /// The module does not know the command id
    UnknownCommand = 3,
    /// Well-formed frame, semantically invalid parameters
    InvalidArgument = 4,
    /// The board refused the hardware operation
    HardwareFault = 5,
}

impl StatusCode {
    /// Parses a wire status byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::Accepted),
            2 => Some(StatusCode::UnknownModule),
            3 => Some(StatusCode::UnknownCommand),
            4 => Some(StatusCode::InvalidArgument),
            5 => Some(StatusCode::HardwareFault),
            _ => None,
        }
    }

    /// Returns true for `Ok` and `Accepted`
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::Accepted)
    }
}

/// Configuration for a firmware instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Maximum argument/return payload per frame
    pub max_buffer: usize,
    /// Modules compiled into this build
    pub enabled_modules: ModuleSet,
    /// Stepper axes available
    pub max_steppers: usize,
    /// Servo channels available
    pub max_servos: usize,
    /// Rotary encoders available
    pub max_encoders: usize,
    /// Pins the pin module can watch for edges
    pub max_watched_pins: usize,
    /// Analog sensor channels available
    pub max_sensors: usize,
    /// Display panels available
    pub max_displays: usize,
    /// Endstops are ignored for this long after each flank
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub endstop_debounce: Duration,
    /// Sleep between loop iterations when nothing was received
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub idle_interval: Duration,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        FirmwareConfig {
            max_buffer: super::DEFAULT_MAX_BUFFER,
            enabled_modules: ModuleSet::all(),
            max_steppers: 8,
            max_servos: 4,
            max_encoders: 8,
            max_watched_pins: 8,
            max_sensors: 8,
            max_displays: 4,
            endstop_debounce: Duration::from_millis(5),
            idle_interval: Duration::from_millis(1),
        }
    }
}

impl FirmwareConfig {
    /// Checks that the configuration describes a usable firmware
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer < 8 {
            return Err(Error::config("max_buffer must hold at least 8 payload bytes"));
        }
        if self.max_buffer > super::MAX_FRAME_CAPACITY {
            return Err(Error::config(format!(
                "max_buffer {} exceeds frame capacity {}",
                self.max_buffer,
                super::MAX_FRAME_CAPACITY
            )));
        }
        if !self.enabled_modules.contains(ModuleKind::System) {
            return Err(Error::config("the system module cannot be disabled"));
        }

        let limits = [
            (ModuleKind::Stepper, self.max_steppers),
            (ModuleKind::Servo, self.max_servos),
            (ModuleKind::Encoder, self.max_encoders),
            (ModuleKind::Pin, self.max_watched_pins),
            (ModuleKind::Sensor, self.max_sensors),
            (ModuleKind::Display, self.max_displays),
        ];
        for (kind, limit) in limits {
            if self.enabled_modules.contains(kind) && limit == 0 {
                return Err(Error::config(format!("{} module enabled with zero units", kind.name())));
            }
            if limit > u8::MAX as usize {
                return Err(Error::config(format!("{} unit limit exceeds 255", kind.name())));
            }
        }

        Ok(())
    }
}

/// Configuration for the controller side of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum argument/return payload per frame
    pub max_buffer: usize,
    /// How long to wait for a result frame
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            max_buffer: super::DEFAULT_MAX_BUFFER,
            response_timeout: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_kind_ids() {
        for kind in ModuleKind::ALL {
            assert_eq!(ModuleKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(ModuleKind::from_id(ModuleId(99)), None);
        assert_eq!(ModuleKind::Stepper.id().to_string(), "stepper(1)");
        assert_eq!(ModuleId(42).to_string(), "module(42)");
    }

    #[test]
    fn test_module_set() {
        let set: ModuleSet = [ModuleKind::System, ModuleKind::Pin].into_iter().collect();
        assert!(set.contains(ModuleKind::Pin));
        assert!(!set.contains(ModuleKind::Stepper));
        assert_eq!(set.0, 0b1001);

        let missing = ModuleSet::all().difference(set);
        assert_eq!(
            missing.kinds().collect::<Vec<_>>(),
            vec![
                ModuleKind::Stepper,
                ModuleKind::Servo,
                ModuleKind::Encoder,
                ModuleKind::Sensor,
                ModuleKind::Display
            ]
        );
        assert_eq!(ModuleSet::all().0, 0b111_1111);
    }

    #[test]
    fn test_status_code_parsing() {
        for raw in 0..=5u8 {
            let status = StatusCode::from_u8(raw).unwrap();
            assert_eq!(status as u8, raw);
        }
        assert!(StatusCode::from_u8(6).is_none());
        assert!(StatusCode::Accepted.is_success());
        assert!(!StatusCode::UnknownModule.is_success());
    }

    #[test]
    fn test_config_validation() {
        assert!(FirmwareConfig::default().validate().is_ok());

        let config = FirmwareConfig { max_buffer: 4, ..Default::default() };
        assert!(config.validate().is_err());

        let config = FirmwareConfig {
            enabled_modules: ModuleSet::empty().with(ModuleKind::Stepper),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FirmwareConfig { max_servos: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = FirmwareConfig { max_displays: 0, ..Default::default() };
        assert!(config.validate().is_err());

        // A disabled module may carry a zero limit
        let config = FirmwareConfig {
            enabled_modules: ModuleSet::empty().with(ModuleKind::System).with(ModuleKind::Pin),
            max_servos: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json() {
        let config = FirmwareConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FirmwareConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_buffer, config.max_buffer);
        assert_eq!(parsed.enabled_modules, config.enabled_modules);
        assert_eq!(parsed.endstop_debounce, Duration::from_millis(5));
    }
}
