//! Controller side of the link
//!
//! [`Controller`] talks to a firmware over any [`Transport`]; it encodes
//! commands, waits for the matching result and keeps count of failed
//! transmissions. [`AsyncController`] does the same over a tokio byte
//! stream.

mod client;

pub use self::client::AsyncController;

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::core::{ControllerConfig, Error, ModuleKind, Result, StatusCode};
use crate::firmware::{Compatibility, EventRecord, VersionRecord, EVENT_RECORD_LEN, VERSION_RECORD_LEN};
use crate::modules::system;
use crate::protocol::{decode_result, encode_command, CommandEnvelope, ResultEnvelope};
use crate::transport::Transport;

/// Pause between polls when waiting on a hardware link
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Blocking controller over a frame transport
pub struct Controller<T: Transport> {
    transport: T,
    config: ControllerConfig,
    sent_errors: u16,
    result_errors: u16,
}

impl<T: Transport> Controller<T> {
    pub fn new(transport: T, config: ControllerConfig) -> Self {
        Controller {
            transport,
            config,
            sent_errors: 0,
            result_errors: 0,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Encodes and sends one command
    pub fn send_command(&mut self, command: &CommandEnvelope) -> Result<()> {
        if command.args.len() > self.config.max_buffer {
            self.sent_errors = self.sent_errors.saturating_add(1);
            return Err(Error::protocol(format!(
                "{} argument bytes exceed buffer capacity {}",
                command.args.len(),
                self.config.max_buffer
            )));
        }

        let mut frame = BytesMut::new();
        encode_command(command, &mut frame);
        trace!("sending {} command {} unit {}", command.module_id, command.command_id, command.unit);
        if let Err(e) = self.transport.send(&frame) {
            self.sent_errors = self.sent_errors.saturating_add(1);
            return Err(e);
        }
        Ok(())
    }

    /// Next result frame if one has arrived
    pub fn read_result(&mut self) -> Result<Option<ResultEnvelope>> {
        let frame = match self.transport.receive_available() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.result_errors = self.result_errors.saturating_add(1);
                return Err(e);
            }
        };
        match decode_result(&frame, self.config.max_buffer) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                self.result_errors = self.result_errors.saturating_add(1);
                warn!("discarding result frame: {}", e);
                Err(e.into())
            }
        }
    }

    /// Drops result frames left over from earlier calls, returns how many
    ///
    /// A reply that arrives after its call timed out would otherwise be
    /// taken as the answer to the next command.
    pub fn discard_stale(&mut self) -> Result<usize> {
        let mut discarded = 0;
        loop {
            match self.transport.receive_available() {
                Ok(Some(frame)) => {
                    warn!("discarding late result frame of {} bytes", frame.len());
                    self.result_errors = self.result_errors.saturating_add(1);
                    discarded += 1;
                }
                Ok(None) => return Ok(discarded),
                Err(e) => {
                    self.result_errors = self.result_errors.saturating_add(1);
                    return Err(e);
                }
            }
        }
    }

    /// Sends `command` and waits for its result
    ///
    /// `pump` runs between polls; in-process links use it to step the
    /// firmware, hardware links to sleep. Gives up after `response_timeout`.
    /// Results still queued from earlier calls are discarded first.
    pub fn call<F>(&mut self, command: &CommandEnvelope, mut pump: F) -> Result<ResultEnvelope>
    where
        F: FnMut() -> Result<()>,
    {
        self.discard_stale()?;
        self.send_command(command)?;
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if let Some(result) = self.read_result()? {
                debug!("{} command {} -> {:?}", command.module_id, command.command_id, result.status);
                return Ok(result);
            }
            if Instant::now() >= deadline {
                self.result_errors = self.result_errors.saturating_add(1);
                return Err(Error::timeout(format!(
                    "no result for {} command {} within {:?}",
                    command.module_id, command.command_id, self.config.response_timeout
                )));
            }
            pump()?;
        }
    }

    /// [`call`](Self::call) for links served by another thread or device
    pub fn request(&mut self, command: &CommandEnvelope) -> Result<ResultEnvelope> {
        self.call(command, || {
            std::thread::sleep(POLL_INTERVAL);
            Ok(())
        })
    }

    /// Calls a system command and checks status and reply length
    fn system<F>(&mut self, command: CommandEnvelope, len: usize, pump: F) -> Result<ResultEnvelope>
    where
        F: FnMut() -> Result<()>,
    {
        let result = self.call(&command, pump)?;
        if result.status != StatusCode::Ok {
            return Err(Error::protocol(format!(
                "system command {} failed with {:?}",
                command.command_id, result.status
            )));
        }
        if result.data.len() != len {
            self.result_errors = self.result_errors.saturating_add(1);
            return Err(Error::protocol(format!(
                "system command {} returned {} bytes, expected {}",
                command.command_id,
                result.data.len(),
                len
            )));
        }
        Ok(result)
    }

    pub fn get_version<F>(&mut self, pump: F) -> Result<VersionRecord>
    where
        F: FnMut() -> Result<()>,
    {
        let command = CommandEnvelope::to(ModuleKind::System, system::cmd::GET_VERSION);
        let result = self.system(command, VERSION_RECORD_LEN, pump)?;
        VersionRecord::from_bytes(&result.data).ok_or_else(|| Error::protocol("malformed version record"))
    }

    /// Compares the firmware's version record against `expected`
    pub fn check_version<F>(&mut self, expected: &VersionRecord, pump: F) -> Result<Compatibility>
    where
        F: FnMut() -> Result<()>,
    {
        let firmware = self.get_version(pump)?;
        let compatibility = firmware.compare(expected);
        if compatibility != Compatibility::Exact {
            warn!(
                "firmware {}.{}.{} vs expected {}.{}.{}: {:?}",
                firmware.major, firmware.minor, firmware.patch, expected.major, expected.minor, expected.patch, compatibility
            );
        }
        Ok(compatibility)
    }

    /// Reads and clears the firmware's event record
    pub fn clear_interrupt<F>(&mut self, pump: F) -> Result<EventRecord>
    where
        F: FnMut() -> Result<()>,
    {
        let command = CommandEnvelope::to(ModuleKind::System, system::cmd::CLEAR_INTERRUPT);
        let result = self.system(command, EVENT_RECORD_LEN, pump)?;
        EventRecord::from_bytes(&result.data).ok_or_else(|| Error::protocol("malformed event record"))
    }

    /// Sends `data` to the firmware and checks it comes back unchanged
    pub fn ping_back<F>(&mut self, data: &[u8], pump: F) -> Result<bool>
    where
        F: FnMut() -> Result<()>,
    {
        if data.len() > u8::MAX as usize {
            return Err(Error::protocol(format!("ping of {} bytes exceeds 255", data.len())));
        }
        let mut args = Vec::with_capacity(data.len() + 1);
        args.push(data.len() as u8);
        args.extend_from_slice(data);
        let command = CommandEnvelope::to(ModuleKind::System, system::cmd::PING_BACK).with_args(args);

        let result = self.system(command, data.len(), pump)?;
        Ok(&result.data[..] == data)
    }

    /// Resets every module on the firmware
    pub fn reset<F>(&mut self, pump: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let command = CommandEnvelope::to(ModuleKind::System, system::cmd::RESET);
        self.system(command, 0, pump)?;
        Ok(())
    }

    /// Failed sends since the last call, resets the count
    pub fn sent_errors(&mut self) -> u16 {
        std::mem::take(&mut self.sent_errors)
    }

    /// Failed or malformed results since the last call, resets the count
    pub fn result_errors(&mut self) -> u16 {
        std::mem::take(&mut self.result_errors)
    }

    /// Sum of both counters, resets them
    pub fn transmission_errors(&mut self) -> u16 {
        self.sent_errors().saturating_add(self.result_errors())
    }
}
