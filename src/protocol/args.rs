//! Typed access to argument and return bytes
//!
//! Every multi-byte value on the wire is little-endian. Handlers read their
//! arguments through [`ArgReader`], which turns a short or overlong argument
//! run into `InvalidArgument` instead of reading garbage, and build their
//! replies with [`Reply`].

use bytes::{Buf, BufMut, BytesMut};

use crate::core::{CommandError, StatusCode};
use super::message::ResultEnvelope;

/// Cursor over a command's argument bytes
#[derive(Debug)]
pub struct ArgReader<'a> {
    buf: &'a [u8],
}

impl<'a> ArgReader<'a> {
    /// Creates a reader over the given argument bytes
    pub fn new(buf: &'a [u8]) -> Self {
        ArgReader { buf }
    }

    fn need(&self, len: usize) -> Result<(), CommandError> {
        if self.buf.remaining() < len {
            return Err(CommandError::invalid(format!(
                "expected {} more argument bytes, got {}",
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, CommandError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i8(&mut self) -> Result<i8, CommandError> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    /// Reads one byte as a flag, any non-zero value is true
    pub fn bool(&mut self) -> Result<bool, CommandError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, CommandError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn i32(&mut self) -> Result<i32, CommandError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    /// Reads a finite f32
    pub fn f32(&mut self) -> Result<f32, CommandError> {
        self.need(4)?;
        let value = self.buf.get_f32_le();
        if !value.is_finite() {
            return Err(CommandError::invalid("non-finite float argument"));
        }
        Ok(value)
    }

    /// Takes the next `len` raw bytes
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CommandError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Ensures every argument byte was consumed
    pub fn finish(self) -> Result<(), CommandError> {
        if !self.buf.is_empty() {
            return Err(CommandError::invalid(format!(
                "{} unexpected trailing argument bytes",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// Reply under construction inside a module handler
#[derive(Debug)]
pub struct Reply {
    status: StatusCode,
    data: BytesMut,
}

impl Reply {
    /// Synchronous success
    pub fn ok() -> Self {
        Reply {
            status: StatusCode::Ok,
            data: BytesMut::new(),
        }
    }

    /// Background action armed
    pub fn accepted() -> Self {
        Reply {
            status: StatusCode::Accepted,
            data: BytesMut::new(),
        }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.data.put_u8(value);
        self
    }

    pub fn i8(mut self, value: i8) -> Self {
        self.data.put_i8(value);
        self
    }

    pub fn bool(self, value: bool) -> Self {
        self.u8(value as u8)
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.data.put_u16_le(value);
        self
    }

    pub fn i32(mut self, value: i32) -> Self {
        self.data.put_i32_le(value);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.data.put_u32_le(value);
        self
    }

    pub fn f32(mut self, value: f32) -> Self {
        self.data.put_f32_le(value);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.data.extend_from_slice(value);
        self
    }

    /// Status this reply will carry
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Number of return bytes written so far
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Freezes the reply into a result envelope
    pub fn into_result(self) -> ResultEnvelope {
        ResultEnvelope {
            status: self.status,
            data: self.data.freeze(),
        }
    }
}
