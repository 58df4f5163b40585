use std::io::{Read, Write};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serialport::SerialPort;
use tracing::{debug, warn};

use crate::core::{Error, Result};
use crate::protocol::{command_frame_len, result_frame_len, COMMAND_HEADER_LEN, RESULT_HEADER_LEN};
use super::Transport;

/// Which frames arrive on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Firmware side: command frames come in
    Command,
    /// Controller side: result frames come in
    Result,
}

impl FrameKind {
    fn header_len(self) -> usize {
        match self {
            FrameKind::Command => COMMAND_HEADER_LEN,
            FrameKind::Result => RESULT_HEADER_LEN,
        }
    }

    fn frame_len(self, src: &[u8]) -> Option<usize> {
        match self {
            FrameKind::Command => command_frame_len(src),
            FrameKind::Result => result_frame_len(src),
        }
    }
}

/// Reassembles frames from a byte stream
#[derive(Debug)]
pub struct FrameSplitter {
    kind: FrameKind,
    max_buffer: usize,
    buffer: BytesMut,
}

impl FrameSplitter {
    pub fn new(kind: FrameKind, max_buffer: usize) -> Self {
        FrameSplitter {
            kind,
            max_buffer,
            buffer: BytesMut::with_capacity(kind.header_len() + max_buffer),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, if any
    ///
    /// A header declaring more than `max_buffer` payload bytes cannot be
    /// resynchronised; everything buffered is handed out as one frame so the
    /// decoder reports it as oversize.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let len = self.kind.frame_len(&self.buffer)?;
        if len - self.kind.header_len() > self.max_buffer {
            warn!("frame header declares {} bytes, dropping {} buffered bytes", len, self.buffer.len());
            return Some(self.buffer.split().freeze());
        }
        if self.buffer.len() < len {
            return None;
        }
        Some(self.buffer.split_to(len).freeze())
    }
}

/// Frame link over a serial port
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    splitter: FrameSplitter,
    scratch: Vec<u8>,
}

impl SerialTransport {
    /// Opens a serial device
    pub fn open(device_path: &str, baud_rate: u32, kind: FrameKind, max_buffer: usize) -> Result<Self> {
        let port = serialport::new(device_path, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| Error::transport(format!("Failed to open serial device {}: {}", device_path, e)))?;
        debug!("opened {} at {} baud", device_path, baud_rate);
        Ok(Self::new(port, kind, max_buffer))
    }

    /// Wraps an already opened port
    pub fn new(port: Box<dyn SerialPort>, kind: FrameKind, max_buffer: usize) -> Self {
        SerialTransport {
            port,
            splitter: FrameSplitter::new(kind, max_buffer),
            scratch: vec![0; 256],
        }
    }
}

impl Transport for SerialTransport {
    fn receive_available(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.splitter.next_frame() {
            return Ok(Some(frame));
        }
        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| Error::transport(format!("Failed to poll serial port: {}", e)))?
            as usize;
        if available == 0 {
            return Ok(None);
        }
        let want = available.min(self.scratch.len());
        let read = self.port.read(&mut self.scratch[..want])?;
        self.splitter.push(&self.scratch[..read]);
        Ok(self.splitter.next_frame())
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DecodeError;
    use crate::protocol::{decode_command, encode_command, CommandEnvelope};
    use crate::core::ModuleKind;

    fn frame(cmd: &CommandEnvelope) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        encode_command(cmd, &mut bytes);
        bytes.to_vec()
    }

    #[test]
    fn test_splits_byte_stream() {
        let first = CommandEnvelope::to(ModuleKind::Pin, 1).with_args(vec![13]);
        let second = CommandEnvelope::to(ModuleKind::System, 3);
        let mut stream = frame(&first);
        stream.extend_from_slice(&frame(&second));

        let mut splitter = FrameSplitter::new(FrameKind::Command, 64);
        splitter.push(&stream[..3]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&stream[3..]);

        let a = splitter.next_frame().unwrap();
        assert_eq!(decode_command(&a, 64).unwrap(), first);
        let b = splitter.next_frame().unwrap();
        assert_eq!(decode_command(&b, 64).unwrap(), second);
        assert!(splitter.next_frame().is_none());
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_oversize_header_flushes_buffer() {
        let mut splitter = FrameSplitter::new(FrameKind::Command, 64);
        splitter.push(&[1, 1, 0, 200, 0, 7, 7]);
        let junk = splitter.next_frame().unwrap();
        assert_eq!(junk.len(), 7);
        assert_eq!(
            decode_command(&junk, 64),
            Err(DecodeError::Oversize { declared: 200, max: 64 })
        );
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_result_frames() {
        let mut splitter = FrameSplitter::new(FrameKind::Result, 64);
        splitter.push(&[0, 2, 0, 0xAA]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&[0xBB, 1, 0, 0]);
        assert_eq!(&splitter.next_frame().unwrap()[..], &[0, 2, 0, 0xAA, 0xBB]);
        assert_eq!(&splitter.next_frame().unwrap()[..], &[1, 0, 0]);
    }
}
