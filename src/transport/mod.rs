//! Byte transports between controller and firmware
//!
//! A transport moves whole frames. Message-oriented links hand over one frame
//! per call; stream links (serial) split the byte stream with the frame
//! length helpers in [`crate::protocol`].

mod memory;
mod serial;

pub use self::memory::MemoryTransport;
pub use self::serial::{FrameKind, FrameSplitter, SerialTransport};

use bytes::Bytes;

use crate::core::Result;

/// Point-to-point frame link
pub trait Transport {
    /// Returns the next complete frame if one has arrived, never blocks
    fn receive_available(&mut self) -> Result<Option<Bytes>>;

    /// Sends one complete frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn receive_available(&mut self) -> Result<Option<Bytes>> {
        (**self).receive_available()
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        (**self).send(frame)
    }
}
