//! Single-slot event mailbox
//!
//! The firmware reports asynchronous conditions (an action finished, an
//! endstop was hit, a watched pin flipped) through one record. A newer event
//! overwrites an unread one; the controller reads and clears it with
//! `CLEAR_INTERRUPT`. Events raised faster than the controller polls are
//! lost, which keeps memory bounded and every operation O(1).

use bytes::{Buf, BufMut};
use tracing::{debug, trace};

use crate::core::{HardwareError, ModuleId, ModuleKind};
use crate::hal::{Board, PinMode};

/// Wire length of an encoded [`EventRecord`]
pub const EVENT_RECORD_LEN: usize = 7;

/// Cause of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventReason {
    None = 0,
    ActionCompleted = 1,
    ActionStopped = 2,
    EndstopHit = 3,
    HardwareFault = 4,
    ExternalInterrupt = 5,
    MalformedFrame = 6,
}

impl EventReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EventReason::None),
            1 => Some(EventReason::ActionCompleted),
            2 => Some(EventReason::ActionStopped),
            3 => Some(EventReason::EndstopHit),
            4 => Some(EventReason::HardwareFault),
            5 => Some(EventReason::ExternalInterrupt),
            6 => Some(EventReason::MalformedFrame),
            _ => None,
        }
    }
}

/// The most recent asynchronous condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub reason: EventReason,
    /// Module that raised the event
    pub module_id: ModuleId,
    /// Unit inside that module
    pub unit: u8,
    /// Reason-specific value: a position, an angle, a pin number
    pub payload: i32,
    /// Board time the event was raised; not sent over the wire
    pub timestamp_ms: u64,
}

impl EventRecord {
    /// The empty record
    pub fn none() -> Self {
        EventRecord {
            reason: EventReason::None,
            module_id: ModuleKind::System.id(),
            unit: 0,
            payload: 0,
            timestamp_ms: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.reason == EventReason::None
    }

    /// Wire form: `reason | module | unit | payload:i32 LE`
    pub fn to_bytes(&self) -> [u8; EVENT_RECORD_LEN] {
        let mut out = [0u8; EVENT_RECORD_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(self.reason as u8);
        buf.put_u8(self.module_id.0);
        buf.put_u8(self.unit);
        buf.put_i32_le(self.payload);
        out
    }

    /// Parses the wire form, `None` if short or the reason is unknown
    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EVENT_RECORD_LEN {
            return None;
        }
        let reason = EventReason::from_u8(bytes.get_u8())?;
        Some(EventRecord {
            reason,
            module_id: ModuleId(bytes.get_u8()),
            unit: bytes.get_u8(),
            payload: bytes.get_i32_le(),
            timestamp_ms: 0,
        })
    }
}

impl Default for EventRecord {
    fn default() -> Self {
        EventRecord::none()
    }
}

/// Optional hardware line asserted while an event is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalLine {
    pub pin: u8,
    pub active_high: bool,
}

/// Owner of the event slot and the signal line
#[derive(Debug, Default)]
pub struct EventReporter {
    current: EventRecord,
    raised: u32,
    overwritten: u32,
    signal: Option<SignalLine>,
    /// Level last driven onto the signal line, `None` until first sync
    driven: Option<bool>,
}

impl EventReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the current record, last writer wins
    pub fn raise(&mut self, reason: EventReason, module_id: ModuleId, unit: u8, payload: i32, now: u64) {
        if reason == EventReason::None {
            trace!("ignoring raise without a reason");
            return;
        }
        if !self.current.is_none() {
            self.overwritten = self.overwritten.wrapping_add(1);
            debug!(
                "event {:?} from {} overwritten before it was polled",
                self.current.reason, self.current.module_id
            );
        }
        self.raised = self.raised.wrapping_add(1);
        self.current = EventRecord {
            reason,
            module_id,
            unit,
            payload,
            timestamp_ms: now,
        };
        debug!("event raised: {:?} from {} unit {} payload {}", reason, module_id, unit, payload);
    }

    /// Returns the current record and resets the slot to `None`
    pub fn poll(&mut self) -> EventRecord {
        std::mem::take(&mut self.current)
    }

    /// Current record without clearing it
    pub fn peek(&self) -> &EventRecord {
        &self.current
    }

    pub fn clear(&mut self) {
        self.current = EventRecord::none();
    }

    /// Events raised since boot
    pub fn raised_count(&self) -> u32 {
        self.raised
    }

    /// Events lost to a newer one before being polled
    pub fn overwritten_count(&self) -> u32 {
        self.overwritten
    }

    pub fn signal_line(&self) -> Option<SignalLine> {
        self.signal
    }

    /// Configures (or removes) the signal line; the pin must already be an output
    pub fn set_signal_line(&mut self, line: Option<SignalLine>) {
        self.signal = line;
        self.driven = None;
    }

    /// Drives the signal line to match the slot, writing only on change
    pub fn sync_signal<B: Board>(&mut self, board: &mut B) -> Result<(), HardwareError> {
        let Some(line) = self.signal else {
            return Ok(());
        };
        let pending = !self.current.is_none();
        let level = pending == line.active_high;
        if self.driven != Some(level) {
            board.digital_write(line.pin, level)?;
            self.driven = Some(level);
            trace!("signal line on pin {} driven {}", line.pin, if level { "high" } else { "low" });
        }
        Ok(())
    }

    /// Configures `pin` as output and makes it the signal line
    pub fn attach_signal_line<B: Board>(&mut self, board: &mut B, line: SignalLine) -> Result<(), HardwareError> {
        board.pin_mode(line.pin, PinMode::Output)?;
        self.set_signal_line(Some(line));
        self.sync_signal(board)
    }
}
